//! Model identifiers, descriptors and download sources

use crate::error::{RetouchError, Result};
use serde::{Deserialize, Serialize};

/// Inpainting backends that callers can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelId {
    /// LaMa: fast, lightweight, always available
    Lama,
    /// Diffusion inpainting: higher quality, accelerator only
    Sdxl,
}

impl ModelId {
    /// The backend that is loaded at startup and used as fallback
    pub const PRIMARY: Self = Self::Lama;

    /// Stable string identifier used on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lama => "lama",
            Self::Sdxl => "sdxl",
        }
    }

    /// Static metadata describing this backend
    #[must_use]
    pub fn descriptor(self) -> ModelDescriptor {
        match self {
            Self::Lama => ModelDescriptor {
                id: self,
                name: "LaMa".to_string(),
                description: "Fast large-mask inpainting, runs on CPU or GPU".to_string(),
            },
            Self::Sdxl => ModelDescriptor {
                id: self,
                name: "Stable Diffusion XL Inpainting".to_string(),
                description: "Generative inpainting with higher fidelity, requires a GPU"
                    .to_string(),
            },
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelId {
    type Err = RetouchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lama" => Ok(Self::Lama),
            "sdxl" => Ok(Self::Sdxl),
            other => Err(RetouchError::validation(format!(
                "Unknown model '{}'. Supported: lama, sdxl",
                other
            ))),
        }
    }
}

/// Metadata about a backend usable on the current hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub name: String,
    pub description: String,
}

/// A single-file ONNX model that can be fetched into the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSource {
    /// File name inside the cache directory
    pub file_name: &'static str,
    /// Download URL
    pub url: &'static str,
    /// Expected SHA-256 (lowercase hex), when published
    pub sha256: Option<&'static str>,
}

/// LaMa exported to ONNX with a fixed 512x512 input
pub const LAMA_SOURCE: ModelSource = ModelSource {
    file_name: "lama_fp32.onnx",
    url: "https://huggingface.co/Carve/LaMa-ONNX/resolve/main/lama_fp32.onnx",
    sha256: None,
};

/// ISNet general-use segmentation model
pub const SEGMENTATION_SOURCE: ModelSource = ModelSource {
    file_name: "isnet-general-use.onnx",
    url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0/isnet-general-use.onnx",
    sha256: None,
};

/// Preprocessing parameters for the segmentation model
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Input size expected by the model, `[width, height]`
    pub target_size: [u32; 2],
    /// Per-channel mean subtracted after scaling by the image's peak value
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation
    pub normalization_std: [f32; 3],
}

impl PreprocessingConfig {
    /// ISNet general-use preprocessing
    #[must_use]
    pub fn isnet() -> Self {
        Self {
            target_size: [1024, 1024],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [1.0, 1.0, 1.0],
        }
    }
}
