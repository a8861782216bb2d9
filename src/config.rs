//! Configuration types for retouching operations

use crate::error::{RetouchError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compute device used by the inference backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// CPU execution (always available)
    Cpu,
}

impl Device {
    /// Next device down the fallback chain, if any
    #[must_use]
    pub fn demote(self) -> Option<Self> {
        match self {
            Self::Cuda => Some(Self::Cpu),
            Self::Cpu => None,
        }
    }

    /// Whether this device is a hardware accelerator
    #[must_use]
    pub fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda)
    }

    /// Human readable device name for status endpoints
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Cuda => "GPU (CUDA)",
            Self::Cpu => "CPU",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Named cap on the largest image side used during inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// 512px
    Fast,
    /// 1024px
    #[default]
    Balanced,
    /// Original resolution
    High,
}

impl QualityPreset {
    /// Maximum dimension for this preset, `None` meaning unbounded
    #[must_use]
    pub fn max_dimension(self) -> Option<u32> {
        match self {
            Self::Fast => Some(512),
            Self::Balanced => Some(1024),
            Self::High => None,
        }
    }

    /// Parse a preset name, falling back to `Balanced` for unknown names
    #[must_use]
    pub fn parse_or_default(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fast" => Self::Fast,
            "high" => Self::High,
            "balanced" => Self::Balanced,
            other => {
                tracing::debug!(quality = %other, "Unknown quality preset, using balanced");
                Self::Balanced
            },
        }
    }
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Configuration for loading and running the inference backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Force CPU execution even when an accelerator is present
    pub force_cpu: bool,

    /// LaMa inpainting model (`None` = download into the cache)
    pub lama_model: Option<PathBuf>,

    /// Segmentation model (`None` = download into the cache)
    pub segmentation_model: Option<PathBuf>,

    /// Directory with the exported diffusion inpainting bundle
    pub diffusion_bundle: Option<PathBuf>,

    /// Minimum accelerator compute capability (major, minor)
    pub min_compute_capability: (u32, u32),

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            force_cpu: false,
            lama_model: None,
            segmentation_model: None,
            diffusion_bundle: None,
            min_compute_capability: (5, 0),
            intra_threads: 0,
        }
    }
}

impl ModelConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// - Explicit model paths that do not exist
    ///
    /// The diffusion bundle is optional and only checked when it is first loaded.
    pub fn validate(&self) -> Result<()> {
        for (label, path) in [
            ("LaMa model", self.lama_model.as_ref()),
            ("segmentation model", self.segmentation_model.as_ref()),
        ] {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(RetouchError::invalid_config(format!(
                        "{} not found at '{}'",
                        label,
                        path.display()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Builder for `ModelConfig`
#[derive(Debug, Default)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn force_cpu(mut self, force: bool) -> Self {
        self.config.force_cpu = force;
        self
    }

    #[must_use]
    pub fn lama_model<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.lama_model = Some(path.into());
        self
    }

    #[must_use]
    pub fn segmentation_model<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.segmentation_model = Some(path.into());
        self
    }

    #[must_use]
    pub fn diffusion_bundle<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.diffusion_bundle = Some(path.into());
        self
    }

    #[must_use]
    pub fn min_compute_capability(mut self, major: u32, minor: u32) -> Self {
        self.config.min_compute_capability = (major, minor);
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    /// Build the configuration without touching the filesystem
    ///
    /// Path checks happen in [`ModelConfig::validate`], which the model manager
    /// runs before loading anything.
    pub fn build(self) -> Result<ModelConfig> {
        if self.config.min_compute_capability.0 == 0 {
            return Err(RetouchError::config_value_error(
                "minimum compute capability",
                format!(
                    "{}.{}",
                    self.config.min_compute_capability.0, self.config.min_compute_capability.1
                ),
                ">= 1.0",
            ));
        }
        Ok(self.config)
    }
}

/// Read a boolean flag the way the deployment scripts set them (`true`, `1`, `yes`)
#[must_use]
pub fn parse_env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
