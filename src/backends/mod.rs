//! Backend implementations
//!
//! - ONNX Runtime backends: LaMa inpainting, diffusion inpainting, ISNet segmentation
//! - Mock backends for tests and local development

pub mod diffusion;
pub mod lama;
pub mod mock;
pub mod onnx;
pub mod segmentation;

pub use self::diffusion::DiffusionBackend;
pub use self::lama::LamaBackend;
pub use self::segmentation::IsnetBackend;

use crate::config::{Device, ModelConfig};
use crate::download::ModelDownloader;
use crate::error::{RetouchError, Result};
use crate::inference::{BackendFactory, InpaintBackend, SegmentationBackend};
use crate::models::{ModelId, ModelSource, LAMA_SOURCE, SEGMENTATION_SOURCE};
use std::path::{Path, PathBuf};

/// Factory creating ONNX Runtime backends
///
/// Models without an explicit path are taken from the download cache. When a cached
/// file is missing it is fetched on the captured runtime, so factory methods must be
/// called from a blocking context (`spawn_blocking`), never from an async task.
#[derive(Debug)]
pub struct OnnxBackendFactory {
    downloader: Option<ModelDownloader>,
    runtime: Option<tokio::runtime::Handle>,
}

impl OnnxBackendFactory {
    /// Create a factory; pass `None` to disable downloads
    #[must_use]
    pub fn new(downloader: Option<ModelDownloader>) -> Self {
        Self {
            downloader,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    fn resolve(&self, explicit: Option<&Path>, source: &ModelSource) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let downloader = self.downloader.as_ref().ok_or_else(|| {
            RetouchError::invalid_config(format!(
                "No path configured for {} and downloads are disabled",
                source.file_name
            ))
        })?;

        if downloader.cache().is_cached(source) {
            return Ok(downloader.cache().model_path(source));
        }

        let runtime = self.runtime.as_ref().ok_or_else(|| {
            RetouchError::internal("Model download requires a Tokio runtime")
        })?;
        runtime.block_on(downloader.ensure_model(source))
    }
}

impl BackendFactory for OnnxBackendFactory {
    fn create_inpainter(
        &self,
        model: ModelId,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Box<dyn InpaintBackend>> {
        match model {
            ModelId::Lama => {
                let path = self.resolve(config.lama_model.as_deref(), &LAMA_SOURCE)?;
                Ok(Box::new(LamaBackend::load(&path, device, config.intra_threads)?))
            },
            ModelId::Sdxl => {
                let dir = config.diffusion_bundle.as_deref().ok_or_else(|| {
                    RetouchError::invalid_config("SDXL_MODEL_DIR is not configured")
                })?;
                Ok(Box::new(DiffusionBackend::load(dir, device, config.intra_threads)?))
            },
        }
    }

    fn create_segmenter(
        &self,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Box<dyn SegmentationBackend>> {
        let path = self.resolve(config.segmentation_model.as_deref(), &SEGMENTATION_SOURCE)?;
        Ok(Box::new(IsnetBackend::load(&path, device, config.intra_threads)?))
    }
}
