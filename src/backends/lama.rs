//! LaMa inpainting on ONNX Runtime
//!
//! The exported graph takes a fixed 512x512 image and mask. Inputs are resized to
//! that size, the prediction is scaled back, and only masked pixels are replaced so
//! the untouched region keeps full resolution.

use crate::backends::onnx::{build_session, inference_failure, to_tensor, value_to_array4};
use crate::config::Device;
use crate::error::{RetouchError, Result};
use crate::inference::InpaintBackend;
use crate::models::ModelId;
use crate::utils::geometry::MASK_THRESHOLD;
use crate::utils::ImagePreprocessor;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ort::session::Session;
use std::path::Path;

/// Input side of the exported LaMa graph
pub const LAMA_INPUT_SIZE: u32 = 512;

/// LaMa backend bound to one device
#[derive(Debug)]
pub struct LamaBackend {
    session: Session,
    device: Device,
}

impl LamaBackend {
    /// Load the LaMa graph from `model_path`
    ///
    /// # Errors
    /// - Session creation failures on `device`
    pub fn load(model_path: &Path, device: Device, intra_threads: usize) -> Result<Self> {
        let session = build_session(model_path, device, intra_threads, "LaMa")?;
        Ok(Self { session, device })
    }
}

impl InpaintBackend for LamaBackend {
    fn model_id(&self) -> ModelId {
        ModelId::Lama
    }

    fn device(&self) -> Device {
        self.device
    }

    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        if image.dimensions() != mask.dimensions() {
            return Err(RetouchError::processing(format!(
                "Mask {:?} does not match image {:?}",
                mask.dimensions(),
                image.dimensions()
            )));
        }
        let (width, height) = image.dimensions();

        let model_image = imageops::resize(image, LAMA_INPUT_SIZE, LAMA_INPUT_SIZE, FilterType::Lanczos3);
        let model_mask = imageops::resize(mask, LAMA_INPUT_SIZE, LAMA_INPUT_SIZE, FilterType::Nearest);

        let image_value = to_tensor(ImagePreprocessor::unit_tensor(&model_image))?;
        let mask_value = to_tensor(ImagePreprocessor::mask_tensor(&model_mask))?;

        let outputs = self
            .session
            .run(ort::inputs![image_value, mask_value])
            .map_err(|e| inference_failure(self.device, "LaMa inpainting", &e))?;
        let prediction = value_to_array4(&outputs[0])?;
        drop(outputs);

        let generated = ImagePreprocessor::tensor_to_rgb(&prediction)?;
        let generated = imageops::resize(&generated, width, height, FilterType::Lanczos3);

        let mut result = image.clone();
        for (x, y, pixel) in result.enumerate_pixels_mut() {
            if mask.get_pixel(x, y).0[0] > MASK_THRESHOLD {
                *pixel = *generated.get_pixel(x, y);
            }
        }

        log::debug!("LaMa filled {}x{} on {}", width, height, self.device);
        Ok(result)
    }
}
