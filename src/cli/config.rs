//! Conversion of command-line arguments into library configuration

use crate::cli::main_impl::Cli;
use crate::config::{parse_env_flag, ModelConfig};
use crate::server::ServerConfig;
use anyhow::{Context, Result};

/// Parser for boolean switches that also arrive through the environment
pub(crate) fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    Ok(parse_env_flag(value))
}

/// Convert CLI arguments into the model and server configuration
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Model paths, device policy and threading
    pub(crate) fn model_config(cli: &Cli) -> Result<ModelConfig> {
        let mut builder = ModelConfig::builder()
            .force_cpu(cli.force_cpu)
            .intra_threads(cli.threads);
        if let Some(path) = &cli.lama_model {
            builder = builder.lama_model(path);
        }
        if let Some(path) = &cli.segmentation_model {
            builder = builder.segmentation_model(path);
        }
        if let Some(dir) = &cli.sdxl_model_dir {
            builder = builder.diffusion_bundle(dir);
        }

        let config = builder.build().context("Invalid model configuration")?;
        config.validate().context("Invalid model configuration")?;
        Ok(config)
    }

    /// Bind address, CORS and upload limits
    pub(crate) fn server_config(cli: &Cli) -> ServerConfig {
        let cors_origins = cli
            .cors_origins
            .iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        ServerConfig {
            host: cli.host.clone(),
            port: cli.port,
            cors_origins,
            max_upload_mb: cli.max_upload_mb,
        }
    }
}
