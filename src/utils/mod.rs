//! Shared utilities: image geometry, tensor conversion and device selection

pub mod geometry;
pub mod preprocessing;
pub mod providers;

pub use geometry::{CanvasExtension, Rect};
pub use preprocessing::ImagePreprocessor;
pub use providers::{select_device, AcceleratorInfo, DeviceProbe, OrtDeviceProbe};
