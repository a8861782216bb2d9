//! Inference backend abstraction
//!
//! Backends are created through a [`BackendFactory`] so the model manager can be
//! driven by ONNX Runtime in production and by mocks in tests.

use crate::{
    config::{Device, ModelConfig},
    error::Result,
    models::ModelId,
};
use image::{GrayImage, RgbImage};

/// A loaded inpainting model bound to one device
pub trait InpaintBackend: Send {
    /// Which model this backend runs
    fn model_id(&self) -> ModelId;

    /// Device the backend was loaded on
    fn device(&self) -> Device;

    /// Fill the white region of `mask` in `image`
    ///
    /// `mask` has the same dimensions as `image` and is binary (0 or 255). The
    /// result has the same dimensions as `image`.
    ///
    /// # Errors
    /// - Tensor conversion failures
    /// - Runtime inference failures (out of memory, kernel errors)
    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage>;
}

/// A loaded foreground segmentation model
pub trait SegmentationBackend: Send {
    /// Device the backend was loaded on
    fn device(&self) -> Device;

    /// Predict a soft foreground mask with the same dimensions as `image`
    ///
    /// # Errors
    /// - Tensor conversion failures
    /// - Runtime inference failures
    fn segment(&mut self, image: &RgbImage) -> Result<GrayImage>;
}

/// Creates backends on demand
pub trait BackendFactory: Send + Sync {
    /// Load an inpainting model on `device`
    ///
    /// # Errors
    /// - Model file missing or unreadable
    /// - Device cannot host the model
    fn create_inpainter(
        &self,
        model: ModelId,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Box<dyn InpaintBackend>>;

    /// Load the segmentation model on `device`
    ///
    /// # Errors
    /// - Model file missing or unreadable
    /// - Device cannot host the model
    fn create_segmenter(
        &self,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Box<dyn SegmentationBackend>>;
}
