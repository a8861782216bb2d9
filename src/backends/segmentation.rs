//! ISNet foreground segmentation on ONNX Runtime
//!
//! Pre- and post-processing follow the `isnet-general-use` convention: a 1024x1024
//! stretched input and a min-max normalized soft mask.

use crate::backends::onnx::{build_session, inference_failure, to_tensor, value_to_array4};
use crate::config::Device;
use crate::error::Result;
use crate::inference::SegmentationBackend;
use crate::models::PreprocessingConfig;
use crate::utils::ImagePreprocessor;
use image::{GrayImage, RgbImage};
use ort::session::Session;
use std::path::Path;

/// ISNet general-use segmentation backend
#[derive(Debug)]
pub struct IsnetBackend {
    session: Session,
    device: Device,
    preprocessing: PreprocessingConfig,
}

impl IsnetBackend {
    /// Load the segmentation graph from `model_path`
    ///
    /// # Errors
    /// - Session creation failures on `device`
    pub fn load(model_path: &Path, device: Device, intra_threads: usize) -> Result<Self> {
        let session = build_session(model_path, device, intra_threads, "ISNet segmentation")?;
        Ok(Self {
            session,
            device,
            preprocessing: PreprocessingConfig::isnet(),
        })
    }
}

impl SegmentationBackend for IsnetBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn segment(&mut self, image: &RgbImage) -> Result<GrayImage> {
        let input = ImagePreprocessor::preprocess_for_segmentation(image, &self.preprocessing)?;
        let input_value = to_tensor(input)?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| inference_failure(self.device, "Segmentation", &e))?;
        let prediction = value_to_array4(&outputs[0])?;
        drop(outputs);

        ImagePreprocessor::tensor_to_mask(&prediction, image.dimensions())
    }
}
