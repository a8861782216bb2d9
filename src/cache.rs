//! Local cache for downloaded model files
//!
//! Models live in an XDG-compliant directory:
//! - Linux/macOS: `~/.cache/imgly-retouch/models/`
//! - Windows: `%LOCALAPPDATA%/imgly-retouch/models/`
//!
//! `IMGLY_RETOUCH_CACHE_DIR` overrides the base directory.

use crate::error::{RetouchError, Result};
use crate::models::ModelSource;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache base directory
pub const CACHE_DIR_ENV: &str = "IMGLY_RETOUCH_CACHE_DIR";

/// Information about a cached model file
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// File name inside the cache
    pub file_name: String,
    /// Full path to the file
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Open the default cache, creating the directory when missing
    ///
    /// # Errors
    /// - Failed to determine the user cache directory
    /// - Failed to create the cache directory
    pub fn new() -> Result<Self> {
        Self::with_dir(Self::default_cache_dir()?)
    }

    /// Open a cache rooted at `cache_dir`
    ///
    /// # Errors
    /// - Failed to create the cache directory
    pub fn with_dir<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).map_err(|e| {
                RetouchError::file_io_error("create cache directory", &cache_dir, &e)
            })?;
        }
        Ok(Self { cache_dir })
    }

    fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                RetouchError::invalid_config(format!(
                    "Failed to determine cache directory. Set {} environment variable.",
                    CACHE_DIR_ENV
                ))
            })?
            .join("imgly-retouch")
            .join("models"))
    }

    /// Cache directory path
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path where `source` is (or would be) stored
    #[must_use]
    pub fn model_path(&self, source: &ModelSource) -> PathBuf {
        self.cache_dir.join(source.file_name)
    }

    /// Whether `source` has been downloaded
    #[must_use]
    pub fn is_cached(&self, source: &ModelSource) -> bool {
        let path = self.model_path(source);
        path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
    }

    /// List every `.onnx` file in the cache, sorted by name
    ///
    /// # Errors
    /// - Failed to read the cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            RetouchError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("onnx") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            models.push(CachedModelInfo {
                file_name: file_name.to_string(),
                path: path.clone(),
                size_bytes,
            });
        }

        models.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(models)
    }
}
