//! Retouching server CLI
//!
//! Parses flags (with environment fallbacks), fetches missing model weights, loads the
//! primary model and serves the HTTP API.

use super::config::{parse_flag, CliConfigBuilder};
use crate::backends::OnnxBackendFactory;
use crate::cache::ModelCache;
use crate::config::ModelConfig;
use crate::download::{resolve_model_path, ModelDownloader};
use crate::manager::ModelManager;
use crate::models::{LAMA_SOURCE, SEGMENTATION_SOURCE};
use crate::server::{self, AppState};
use crate::tracing_config::init_server_tracing;
use crate::utils::{select_device, DeviceProbe, OrtDeviceProbe};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Image retouching HTTP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "imgly-retouch")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Run on CPU even when a CUDA GPU is present
    #[arg(
        long,
        env = "FORCE_CPU",
        action = ArgAction::Set,
        value_parser = parse_flag,
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub force_cpu: bool,

    /// LaMa ONNX model [default: downloaded into the cache]
    #[arg(long, env = "LAMA_MODEL_PATH")]
    pub lama_model: Option<PathBuf>,

    /// Segmentation ONNX model [default: downloaded into the cache]
    #[arg(long, env = "SEGMENTATION_MODEL_PATH")]
    pub segmentation_model: Option<PathBuf>,

    /// Directory with the exported diffusion inpainting bundle
    #[arg(long, env = "SDXL_MODEL_DIR")]
    pub sdxl_model_dir: Option<PathBuf>,

    /// Comma separated allowed origins, `*` for any
    #[arg(long, env = "CORS_ORIGINS", default_value = "*", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Maximum request body size in megabytes
    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 50)]
    pub max_upload_mb: usize,

    /// Intra-op inference threads (0 = auto-detect)
    #[arg(short, long, env = "INFERENCE_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Never download models; every model must be cached or given by path
    #[arg(long)]
    pub offline: bool,

    /// Download the models into the cache and exit
    #[arg(long)]
    pub only_download: bool,

    /// List cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Print the model cache directory and exit
    #[arg(long)]
    pub show_cache_dir: bool,

    /// Show accelerator diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,
}

/// Main entry point
///
/// # Errors
/// - Invalid configuration
/// - Model download or load failures
/// - The server cannot bind its address
pub async fn main() -> Result<()> {
    // `.env` first so clap's environment fallbacks see its values
    let dotenv = dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_server_tracing(cli.verbose, cli.json_logs).context("Failed to initialize tracing")?;
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    if cli.show_cache_dir {
        let cache = ModelCache::new()?;
        println!("{}", cache.cache_dir().display());
        return Ok(());
    }

    if cli.list_models {
        return list_cached_models();
    }

    let model_config = CliConfigBuilder::model_config(&cli)?;

    if cli.show_providers {
        show_provider_diagnostics(&model_config);
        return Ok(());
    }

    let downloader = if cli.offline {
        None
    } else {
        let downloader = ModelDownloader::new().context("Failed to open model cache")?;
        prefetch_models(&downloader, &model_config).await?;
        Some(downloader)
    };

    if cli.only_download {
        tracing::info!("Models are cached, exiting");
        return Ok(());
    }

    let load_start = Instant::now();
    let manager = tokio::task::spawn_blocking(move || {
        let factory = OnnxBackendFactory::new(downloader);
        ModelManager::new(model_config, Box::new(factory), &OrtDeviceProbe)
    })
    .await
    .context("Model loading task failed")?
    .context("Failed to load the primary model")?;

    tracing::info!(
        device = %manager.device(),
        elapsed_ms = load_start.elapsed().as_millis(),
        "Primary model loaded"
    );

    let state = AppState::new(
        Arc::new(Mutex::new(manager)),
        CliConfigBuilder::server_config(&cli),
    );
    server::serve(state).await.context("Server error")?;
    Ok(())
}

/// Fetch the LaMa and segmentation weights before the server binds
async fn prefetch_models(downloader: &ModelDownloader, config: &ModelConfig) -> Result<()> {
    for (explicit, source) in [
        (config.lama_model.as_deref(), &LAMA_SOURCE),
        (config.segmentation_model.as_deref(), &SEGMENTATION_SOURCE),
    ] {
        let path = resolve_model_path(explicit, source, downloader)
            .await
            .with_context(|| format!("Failed to obtain {}", source.file_name))?;
        tracing::info!(model = source.file_name, path = %path.display(), "Model ready");
    }
    Ok(())
}

fn list_cached_models() -> Result<()> {
    let cache = ModelCache::new()?;
    let models = cache.scan_cached_models()?;

    if models.is_empty() {
        println!("No cached models in {}", cache.cache_dir().display());
        return Ok(());
    }

    println!("Cached models in {}:", cache.cache_dir().display());
    for model in models {
        println!(
            "  {:<32} {:>8.1} MB",
            model.file_name,
            model.size_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

fn show_provider_diagnostics(config: &ModelConfig) {
    let probe = OrtDeviceProbe;
    match probe.probe_accelerator() {
        Some(info) => {
            let capability = info
                .compute_capability
                .map_or_else(|| "unknown".to_string(), |(major, minor)| format!("{major}.{minor}"));
            println!("CUDA accelerator: {} (compute capability {})", info.name, capability);
        },
        None => println!("CUDA accelerator: not available"),
    }

    let (major, minor) = config.min_compute_capability;
    println!("Minimum compute capability: {major}.{minor}");
    println!("Force CPU: {}", config.force_cpu);
    println!("Selected device: {}", select_device(&probe, config).display_name());
}
