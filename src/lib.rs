#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # IMG.LY Retouch
//!
//! Image retouching service built on ONNX Runtime: inpainting (LaMa, with an optional
//! diffusion backend on CUDA), outpainting, background removal and replacement, and
//! batch cleanup.
//!
//! The crate is the orchestration layer around fixed-function models:
//!
//! - [`ModelManager`] owns the backends, picks the device and falls back from CUDA to
//!   CPU and from the diffusion backend to LaMa
//! - [`utils::geometry`] holds the pure resize, crop, pad and composite steps
//! - [`JobTracker`] runs asynchronous inpainting jobs
//! - [`RetouchProcessor`] implements the synchronous operations
//! - `server` (feature `server`) exposes everything over HTTP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imgly_retouch::{
//!     backends::OnnxBackendFactory, ModelConfig, ModelDownloader, ModelManager,
//!     RetouchProcessor, utils::OrtDeviceProbe,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ModelConfig::builder().force_cpu(true).build()?;
//! let downloader = ModelDownloader::new()?;
//!
//! let manager = tokio::task::spawn_blocking(move || {
//!     let factory = OnnxBackendFactory::new(Some(downloader));
//!     ModelManager::new(config, Box::new(factory), &OrtDeviceProbe)
//! })
//! .await??;
//!
//! let processor = RetouchProcessor::new(Arc::new(Mutex::new(manager)));
//! let image = image::open("photo.jpg")?.to_rgb8();
//! let mask = processor.auto_mask(image, true).await?;
//! mask.save("background.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `server` (default): HTTP server, command-line entry point and log subscriber
//! - `tracing-json`: JSON log output for the server

pub mod backends;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod processor;
pub mod services;
pub mod tracing_config;
pub mod utils;

#[cfg(feature = "server")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

pub use cache::{CachedModelInfo, ModelCache};
pub use config::{Device, ModelConfig, ModelConfigBuilder, QualityPreset};
pub use download::ModelDownloader;
pub use error::{Result, RetouchError};
pub use inference::{BackendFactory, InpaintBackend, SegmentationBackend};
pub use jobs::{JobStatus, JobStatusView, JobTracker};
pub use manager::{lock_manager, ModelManager, SharedManager};
pub use models::{ModelDescriptor, ModelId};
pub use processor::{BatchItem, RefineParams, RetouchProcessor};
pub use tracing_config::{TracingConfig, TracingFormat};
pub use utils::{CanvasExtension, Rect};
