//! Model ownership, device selection and fallback
//!
//! The manager owns every loaded backend. The primary inpainter is loaded when the
//! manager is built; the diffusion inpainter and the segmentation model are loaded
//! on first use. Failures move the manager through explicit transitions:
//!
//! - primary load on CUDA fails: demote to CPU and load again, a CPU failure is fatal
//! - primary inference on CUDA fails: demote, rebuild the primary on CPU, retry once
//! - diffusion bundle missing or failing to load: the slot records the reason and is
//!   never retried, requests fall back to the primary

use crate::config::{Device, ModelConfig};
use crate::error::{RetouchError, Result};
use crate::inference::{BackendFactory, InpaintBackend, SegmentationBackend};
use crate::models::{ModelDescriptor, ModelId};
use crate::utils::geometry::conform_mask;
use crate::utils::{select_device, DeviceProbe};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Manager shared between the processor and the job worker
pub type SharedManager = Arc<Mutex<ModelManager>>;

/// Lock the shared manager, recovering from a poisoned lock
///
/// A panic inside a backend leaves the lock poisoned; the manager state itself is
/// still consistent because every transition is a single assignment.
pub fn lock_manager(manager: &SharedManager) -> MutexGuard<'_, ModelManager> {
    manager.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        tracing::warn!("Model manager lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Lazily populated backend slot with sticky failure
#[derive(Debug)]
enum LazySlot<T> {
    Unloaded,
    Loaded(T),
    Failed(String),
}

/// Owner of all inference backends
pub struct ModelManager {
    config: ModelConfig,
    factory: Box<dyn BackendFactory>,
    device: Device,
    primary: Box<dyn InpaintBackend>,
    secondary: LazySlot<Box<dyn InpaintBackend>>,
    segmenter: Option<Box<dyn SegmentationBackend>>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secondary = match &self.secondary {
            LazySlot::Unloaded => "unloaded".to_string(),
            LazySlot::Loaded(_) => "loaded".to_string(),
            LazySlot::Failed(reason) => format!("failed: {reason}"),
        };
        f.debug_struct("ModelManager")
            .field("device", &self.device)
            .field("secondary", &secondary)
            .field("segmenter_loaded", &self.segmenter.is_some())
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    /// Select the device and load the primary backend
    ///
    /// # Errors
    /// - Invalid configuration
    /// - The primary backend cannot be loaded on any device
    pub fn new(
        config: ModelConfig,
        factory: Box<dyn BackendFactory>,
        probe: &dyn DeviceProbe,
    ) -> Result<Self> {
        config.validate()?;

        let mut device = select_device(probe, &config);
        let primary = loop {
            match factory.create_inpainter(ModelId::PRIMARY, device, &config) {
                Ok(backend) => break backend,
                Err(e) => match device.demote() {
                    Some(next) => {
                        tracing::warn!(
                            error = %e,
                            from = %device,
                            to = %next,
                            "Primary model failed to load, demoting device"
                        );
                        device = next;
                    },
                    None => {
                        tracing::error!(error = %e, "Primary model failed to load on CPU");
                        return Err(e);
                    },
                },
            }
        };

        tracing::info!(device = %device, model = %ModelId::PRIMARY, "Model manager ready");

        Ok(Self {
            config,
            factory,
            device,
            primary,
            secondary: LazySlot::Unloaded,
            segmenter: None,
        })
    }

    /// Active device
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Backends usable on the current hardware
    #[must_use]
    pub fn available_models(&self) -> Vec<ModelDescriptor> {
        let mut models = vec![ModelId::PRIMARY.descriptor()];
        if self.secondary_possible() {
            models.push(ModelId::Sdxl.descriptor());
        }
        models
    }

    fn secondary_possible(&self) -> bool {
        self.device.is_accelerator()
            && self.config.diffusion_bundle.as_deref().is_some_and(Path::is_dir)
            && !matches!(self.secondary, LazySlot::Failed(_))
    }

    /// Inpaint `image` inside `mask` with the requested backend
    ///
    /// The mask is conformed to the image first. Returns the result together with the
    /// backend that actually produced it, which is the primary whenever the requested
    /// one is unavailable.
    ///
    /// # Errors
    /// - Inference failure on CPU, or on both devices after a demotion retry
    pub fn process(
        &mut self,
        image: &RgbImage,
        mask: &GrayImage,
        requested: ModelId,
    ) -> Result<(RgbImage, ModelId)> {
        let mask = conform_mask(mask, image.dimensions());

        if requested == ModelId::Sdxl {
            if let Some(secondary) = self.secondary_backend() {
                match secondary.inpaint(image, &mask) {
                    Ok(result) => return Ok((result, ModelId::Sdxl)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Diffusion inpainting failed, using primary model");
                    },
                }
            } else {
                tracing::debug!("Diffusion backend unavailable, using primary model");
            }
        }

        let result = self.run_primary(image, &mask)?;
        Ok((result, ModelId::PRIMARY))
    }

    /// Return the loaded secondary backend, loading it on first use
    fn secondary_backend(&mut self) -> Option<&mut Box<dyn InpaintBackend>> {
        if !self.device.is_accelerator() {
            return None;
        }

        if matches!(self.secondary, LazySlot::Unloaded) {
            self.secondary = match self.config.diffusion_bundle.as_deref() {
                None => {
                    let reason = RetouchError::invalid_config("SDXL_MODEL_DIR is not configured");
                    tracing::warn!(reason = %reason, "Diffusion backend unavailable");
                    LazySlot::Failed(reason.to_string())
                },
                Some(dir) if !dir.is_dir() => {
                    let reason = RetouchError::invalid_config(format!(
                        "Diffusion bundle '{}' is not a directory",
                        dir.display()
                    ));
                    tracing::warn!(reason = %reason, "Diffusion backend unavailable");
                    LazySlot::Failed(reason.to_string())
                },
                Some(_) => {
                    tracing::info!("Loading diffusion backend");
                    match self
                        .factory
                        .create_inpainter(ModelId::Sdxl, self.device, &self.config)
                    {
                        Ok(backend) => LazySlot::Loaded(backend),
                        Err(e) => {
                            tracing::warn!(error = %e, "Diffusion backend failed to load");
                            LazySlot::Failed(e.to_string())
                        },
                    }
                },
            };
        }

        match &mut self.secondary {
            LazySlot::Loaded(backend) => Some(backend),
            LazySlot::Unloaded | LazySlot::Failed(_) => None,
        }
    }

    fn run_primary(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        match self.primary.inpaint(image, mask) {
            Ok(result) => Ok(result),
            Err(first) => {
                let Some(next) = self.device.demote() else {
                    return Err(first);
                };

                tracing::warn!(
                    error = %first,
                    from = %self.device,
                    to = %next,
                    "Inference failed, demoting device and retrying once"
                );
                self.demote_to(next)?;
                self.primary.inpaint(image, mask)
            },
        }
    }

    /// Move every backend to `device`
    fn demote_to(&mut self, device: Device) -> Result<()> {
        self.primary = self
            .factory
            .create_inpainter(ModelId::PRIMARY, device, &self.config)?;
        self.device = device;

        if !device.is_accelerator() {
            // Only the accelerator can host the diffusion backend
            self.secondary = LazySlot::Unloaded;
        }
        if self
            .segmenter
            .as_ref()
            .is_some_and(|segmenter| segmenter.device() != device)
        {
            self.segmenter = None;
        }
        Ok(())
    }

    /// Predict a foreground mask the size of `image`
    ///
    /// The segmentation model is loaded on first use. A load failure is returned to
    /// the caller and the load is attempted again on the next call.
    ///
    /// # Errors
    /// - Segmentation model cannot be loaded
    /// - Inference failure on every device
    pub fn segment(&mut self, image: &RgbImage) -> Result<GrayImage> {
        let attempt = self.segmenter_backend()?.segment(image);
        let mask = match attempt {
            Ok(mask) => mask,
            Err(first) => {
                let device = self
                    .segmenter
                    .as_ref()
                    .map_or(self.device, |segmenter| segmenter.device());
                let Some(next) = device.demote() else {
                    return Err(first);
                };
                tracing::warn!(error = %first, "Segmentation failed, retrying on {}", next);
                let mut fallback = self.factory.create_segmenter(next, &self.config)?;
                let mask = fallback.segment(image)?;
                self.segmenter = Some(fallback);
                mask
            },
        };

        if mask.dimensions() == image.dimensions() {
            Ok(mask)
        } else {
            Ok(imageops::resize(
                &mask,
                image.width(),
                image.height(),
                FilterType::Triangle,
            ))
        }
    }

    fn segmenter_backend(&mut self) -> Result<&mut Box<dyn SegmentationBackend>> {
        if self.segmenter.is_none() {
            let loaded = match self.factory.create_segmenter(self.device, &self.config) {
                Ok(backend) => backend,
                Err(e) => match self.device.demote() {
                    Some(next) => {
                        tracing::warn!(error = %e, "Segmentation model failed on {}, trying {}", self.device, next);
                        self.factory.create_segmenter(next, &self.config)?
                    },
                    None => return Err(e),
                },
            };
            self.segmenter = Some(loaded);
        }

        self.segmenter
            .as_mut()
            .ok_or_else(|| RetouchError::internal("Segmentation backend missing after load"))
    }
}
