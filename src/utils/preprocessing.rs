//! Tensor conversion for the ONNX backends
//!
//! Segmentation input is stretched to the model's square input, scaled by the
//! brightest channel value and mean-shifted. The prediction is min-max normalized
//! and stretched back to the source size.

use crate::{
    error::{RetouchError, Result},
    models::PreprocessingConfig,
};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array4;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Resize and normalize an image into an NCHW segmentation tensor
    ///
    /// # Errors
    /// - Empty input image
    pub fn preprocess_for_segmentation(
        image: &RgbImage,
        config: &PreprocessingConfig,
    ) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(RetouchError::processing("Cannot segment an empty image"));
        }

        let [width, height] = config.target_size;
        let resized = imageops::resize(image, width, height, FilterType::Lanczos3);
        Ok(Self::normalized_tensor(&resized, config))
    }

    /// Convert an RGB image into a normalized `[1, 3, H, W]` tensor
    ///
    /// Values are divided by the largest channel value in the image, then shifted by
    /// the mean and divided by the standard deviation.
    #[must_use]
    pub fn normalized_tensor(image: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        let peak = image
            .pixels()
            .flat_map(|Rgb(channels)| channels.iter().copied())
            .max()
            .map_or(0.0, f32::from)
            .max(1e-6);

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match image size
        for (x, y, pixel) in image.enumerate_pixels() {
            for channel in 0..3 {
                let value = f32::from(pixel.0[channel]) / peak;
                tensor[[0, channel, y as usize, x as usize]] = (value
                    - config.normalization_mean[channel])
                    / config.normalization_std[channel];
            }
        }

        tensor
    }

    /// Convert an RGB image into a `[1, 3, H, W]` tensor scaled to `[0, 1]`
    #[must_use]
    pub fn unit_tensor(image: &RgbImage) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        #[allow(clippy::indexing_slicing)]
        for (x, y, pixel) in image.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] = f32::from(pixel.0[channel]) / 255.0;
            }
        }

        tensor
    }

    /// Convert a mask into a binary `[1, 1, H, W]` tensor
    #[must_use]
    pub fn mask_tensor(mask: &GrayImage) -> Array4<f32> {
        let (width, height) = mask.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 1, height as usize, width as usize));

        #[allow(clippy::indexing_slicing)]
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel.0[0] > crate::utils::geometry::MASK_THRESHOLD {
                tensor[[0, 0, y as usize, x as usize]] = 1.0;
            }
        }

        tensor
    }

    /// Convert a `[1, 3, H, W]` model output into an RGB image
    ///
    /// Outputs already in `[0, 255]` are used as is; outputs in `[0, 1]` are rescaled.
    ///
    /// # Errors
    /// - Tensor is not `[1, 3, H, W]`
    pub fn tensor_to_rgb(tensor: &Array4<f32>) -> Result<RgbImage> {
        let shape = tensor.shape();
        if shape.first().copied() != Some(1) || shape.get(1).copied() != Some(3) {
            return Err(RetouchError::processing(format!(
                "Expected [1, 3, H, W] image tensor, got {:?}",
                shape
            )));
        }
        let height = shape.get(2).copied().unwrap_or(0);
        let width = shape.get(3).copied().unwrap_or(0);

        let peak = tensor.iter().copied().fold(f32::MIN, f32::max);
        let scale = if peak <= 1.5 { 255.0 } else { 1.0 };

        Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let channel = |c: usize| -> u8 {
                let value = tensor
                    .get([0, c, y as usize, x as usize])
                    .copied()
                    .unwrap_or(0.0);
                (value * scale).round().clamp(0.0, 255.0) as u8
            };
            Rgb([channel(0), channel(1), channel(2)])
        }))
    }

    /// Map a `[1, 1, H, W]` segmentation prediction onto the original image size
    ///
    /// The prediction is min-max normalized and truncated to 8 bits before resizing.
    ///
    /// # Errors
    /// - Tensor is not `[1, 1, H, W]`
    pub fn tensor_to_mask(
        tensor: &Array4<f32>,
        original_dimensions: (u32, u32),
    ) -> Result<GrayImage> {
        let shape = tensor.shape();
        if shape.first().copied() != Some(1) || shape.get(1).copied() != Some(1) {
            return Err(RetouchError::processing(format!(
                "Invalid segmentation output shape {:?}",
                shape
            )));
        }
        let height = shape.get(2).copied().unwrap_or(0) as u32;
        let width = shape.get(3).copied().unwrap_or(0) as u32;

        let (min, max) = tensor
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = (max - min).max(f32::EPSILON);

        let prediction = GrayImage::from_fn(width, height, |x, y| {
            let value = tensor
                .get([0, 0, y as usize, x as usize])
                .copied()
                .unwrap_or(min);
            Luma([(((value - min) / range) * 255.0).clamp(0.0, 255.0) as u8])
        });

        if prediction.dimensions() == original_dimensions {
            return Ok(prediction);
        }
        Ok(imageops::resize(
            &prediction,
            original_dimensions.0,
            original_dimensions.1,
            FilterType::Lanczos3,
        ))
    }
}
