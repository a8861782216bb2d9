//! In-memory ZIP archive for batch results

use crate::error::{RetouchError, Result};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Suffix appended to the stem of every processed file
pub const CLEANED_SUFFIX: &str = "_cleaned";

/// Archive entry name for the `index`-th upload (zero based)
///
/// `photo.jpg` becomes `photo_cleaned.png`; uploads without a usable file name become
/// `image_<n>_cleaned.png` with a one-based `n`.
#[must_use]
pub fn cleaned_entry_name(file_name: Option<&str>, index: usize) -> String {
    let stem = file_name
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name))
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty());

    match stem {
        Some(stem) => format!("{stem}{CLEANED_SUFFIX}.png"),
        None => format!("image_{}{CLEANED_SUFFIX}.png", index + 1),
    }
}

/// Builder for a Deflate-compressed archive held in memory
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    names: HashSet<String>,
}

impl ArchiveBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            names: HashSet::new(),
        }
    }

    /// Add a file and return the entry name actually written
    ///
    /// A name already in the archive gets a `_2`, `_3`, ... suffix before its extension.
    ///
    /// # Errors
    /// - Compression failures
    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<String> {
        let name = self.unique_name(name);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer
            .start_file(name.as_str(), options)
            .map_err(|e| RetouchError::processing(format!("Failed to add '{name}' to archive: {e}")))?;
        self.writer.write_all(data)?;
        self.names.insert(name.clone());
        Ok(name)
    }

    fn unique_name(&self, name: &str) -> String {
        if !self.names.contains(name) {
            return name.to_string();
        }

        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
            _ => (name, None),
        };
        let mut counter = 2usize;
        loop {
            let candidate = match extension {
                Some(extension) => format!("{stem}_{counter}.{extension}"),
                None => format!("{stem}_{counter}"),
            };
            if !self.names.contains(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Number of entries written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Finish the archive and return its bytes
    ///
    /// # Errors
    /// - Failed to write the central directory
    pub fn finish(self) -> Result<Vec<u8>> {
        let cursor = self
            .writer
            .finish()
            .map_err(|e| RetouchError::processing(format!("Failed to finish archive: {e}")))?;
        Ok(cursor.into_inner())
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::ZipArchive;

    #[test]
    fn test_entry_names() {
        assert_eq!(cleaned_entry_name(Some("photo.jpg"), 0), "photo_cleaned.png");
        assert_eq!(cleaned_entry_name(Some("dir/shot.final.png"), 3), "shot.final_cleaned.png");
        assert_eq!(cleaned_entry_name(Some("C:\\x\\pic.webp"), 0), "pic_cleaned.png");
        assert_eq!(cleaned_entry_name(None, 1), "image_2_cleaned.png");
        assert_eq!(cleaned_entry_name(Some(""), 0), "image_1_cleaned.png");
    }

    #[test]
    fn test_archive_contents() {
        let mut builder = ArchiveBuilder::new();
        assert!(builder.is_empty());
        builder.add("a_cleaned.png", b"first").unwrap();
        builder.add("b_cleaned.png", b"second").unwrap();
        assert_eq!(builder.len(), 2);

        let bytes = builder.finish().unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("b_cleaned.png").unwrap(), &mut content)
            .unwrap();
        assert_eq!(content, "second");
        assert_eq!(
            archive.by_index(0).unwrap().compression(),
            CompressionMethod::Deflated
        );
    }

    #[test]
    fn test_repeated_names_get_numbered() {
        let mut builder = ArchiveBuilder::new();
        assert_eq!(builder.add("image_cleaned.png", b"1").unwrap(), "image_cleaned.png");
        assert_eq!(builder.add("image_cleaned.png", b"2").unwrap(), "image_cleaned_2.png");
        assert_eq!(builder.add("image_cleaned_2.png", b"3").unwrap(), "image_cleaned_2_2.png");
        assert_eq!(builder.add("image_cleaned.png", b"4").unwrap(), "image_cleaned_3.png");
        assert_eq!(builder.add("README", b"5").unwrap(), "README");
        assert_eq!(builder.add("README", b"6").unwrap(), "README_2");

        let bytes = builder.finish().unwrap();
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 6);
    }

    #[test]
    fn test_empty_archive_is_valid() {
        let bytes = ArchiveBuilder::new().finish().unwrap();
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 0);
    }
}
