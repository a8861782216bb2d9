//! Service layer for image I/O and batch archives

pub mod archive;
pub mod io;

pub use archive::{cleaned_entry_name, ArchiveBuilder};
pub use io::ImageIOService;
