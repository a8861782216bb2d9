//! Image decoding and encoding service
//!
//! Uploads arrive as raw bytes and results leave as PNG, so everything here works on
//! in-memory buffers.

use crate::error::{RetouchError, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Service for image byte conversions
pub struct ImageIOService;

impl ImageIOService {
    /// Decode an uploaded image, detecting the format from its content
    ///
    /// # Errors
    /// - Empty payload
    /// - Unrecognized or corrupt image data
    ///
    /// # Examples
    /// ```rust
    /// use imgly_retouch::services::ImageIOService;
    ///
    /// assert!(ImageIOService::load_from_bytes(b"not an image").is_err());
    /// ```
    pub fn load_from_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(RetouchError::validation("Uploaded image is empty"));
        }
        Ok(image::load_from_memory(bytes)?)
    }

    /// Encode an image as PNG
    ///
    /// # Errors
    /// - PNG encoder failures
    pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| RetouchError::processing(format!("Failed to encode PNG: {}", e)))?;
        Ok(buffer)
    }
}
