//! Model downloading into the local cache
//!
//! Files are streamed to a `.part` file next to their final location, verified
//! when a checksum is published, then renamed into place so a partially
//! downloaded model is never picked up.

use crate::cache::ModelCache;
use crate::error::{RetouchError, Result};
use crate::models::ModelSource;
use futures_util::stream::TryStreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

/// Model downloader backed by a [`ModelCache`]
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// Create a downloader for the default cache
    ///
    /// # Errors
    /// - Failed to create HTTP client
    /// - Failed to initialize model cache
    pub fn new() -> Result<Self> {
        Self::with_cache(ModelCache::new()?)
    }

    /// Create a downloader for an existing cache
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn with_cache(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| RetouchError::network_error("Failed to create HTTP client", e))?;

        Ok(Self { client, cache })
    }

    /// Cache used by this downloader
    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Return the local path of `source`, downloading it first when needed
    ///
    /// # Errors
    /// - Network errors during download
    /// - Checksum mismatch
    /// - File system errors while writing the cache
    pub async fn ensure_model(&self, source: &ModelSource) -> Result<PathBuf> {
        let final_path = self.cache.model_path(source);
        if self.cache.is_cached(source) {
            log::debug!("Model already cached: {}", final_path.display());
            return Ok(final_path);
        }

        log::info!("Downloading {} from {}", source.file_name, source.url);
        let part_path = final_path.with_extension("onnx.part");

        match self.download_file(source.url, &part_path).await {
            Ok(()) => {
                if !verify_file_integrity(&part_path, source.sha256)? {
                    let _ = fs::remove_file(&part_path);
                    return Err(RetouchError::model(format!(
                        "Checksum mismatch for downloaded model {}",
                        source.file_name
                    )));
                }

                fs::rename(&part_path, &final_path).map_err(|e| {
                    RetouchError::file_io_error("move downloaded model to cache", &final_path, &e)
                })?;
                log::info!("✅ Downloaded {}", source.file_name);
                Ok(final_path)
            },
            Err(e) => {
                if part_path.exists() {
                    if let Err(cleanup_err) = fs::remove_file(&part_path) {
                        log::warn!("Failed to clean up partial download: {}", cleanup_err);
                    }
                }
                Err(e)
            },
        }
    }

    async fn download_file(&self, url: &str, local_path: &Path) -> Result<()> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RetouchError::network_error(format!("Failed to download {}", url), e))?;

        if !response.status().is_success() {
            return Err(RetouchError::network_error(
                format!("Download of {}", url),
                format!("HTTP status {}", response.status()),
            ));
        }

        let total_size = response.content_length();

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| RetouchError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];
        let mut last_logged = 0u64;

        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| RetouchError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| RetouchError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;

            // Progress every 16 MiB
            if downloaded - last_logged >= 16 * 1024 * 1024 {
                last_logged = downloaded;
                match total_size {
                    Some(total) => log::info!(
                        "  {:.1} / {:.1} MB",
                        downloaded as f64 / 1_048_576.0,
                        total as f64 / 1_048_576.0
                    ),
                    None => log::info!("  {:.1} MB", downloaded as f64 / 1_048_576.0),
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| RetouchError::file_io_error("flush file", local_path, &e))?;

        log::debug!("Downloaded {} bytes to {}", downloaded, local_path.display());
        Ok(())
    }
}

/// Resolve a model path: an explicit path wins, otherwise the cached download
///
/// # Errors
/// - Download failures when the model is not cached yet
pub async fn resolve_model_path(
    explicit: Option<&Path>,
    source: &ModelSource,
    downloader: &ModelDownloader,
) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => downloader.ensure_model(source).await,
    }
}

/// Check a file against an optional SHA-256 hex digest
///
/// Returns `true` when no digest is given.
///
/// # Errors
/// - Failed to read the file
pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_hash else {
        return Ok(true);
    };

    let mut file = fs::File::open(file_path).map_err(|e| {
        RetouchError::file_io_error("open file for verification", file_path, &e)
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| {
            RetouchError::file_io_error("read file for verification", file_path, &e)
        })?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or(&[]));
    }
    let actual_hash = format!("{:x}", hasher.finalize());

    if actual_hash.eq_ignore_ascii_case(expected) {
        Ok(true)
    } else {
        log::warn!(
            "File integrity check failed for {}: expected {}, got {}",
            file_path.display(),
            expected,
            actual_hash
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_SOURCE: ModelSource = ModelSource {
        file_name: "test-model.onnx",
        url: "http://127.0.0.1:9/unreachable.onnx",
        sha256: None,
    };

    #[test]
    fn test_verify_file_integrity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        let digest = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(verify_file_integrity(&path, Some(digest)).unwrap());
        assert!(verify_file_integrity(&path, Some(&digest.to_uppercase())).unwrap());
        assert!(!verify_file_integrity(&path, Some("00")).unwrap());
        assert!(verify_file_integrity(&path, None).unwrap());
    }

    #[tokio::test]
    async fn test_cached_model_skips_network() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_dir(temp.path()).unwrap();
        fs::write(cache.model_path(&TEST_SOURCE), b"model").unwrap();

        let downloader = ModelDownloader::with_cache(cache).unwrap();
        let path = downloader.ensure_model(&TEST_SOURCE).await.unwrap();
        assert_eq!(path, temp.path().join("test-model.onnx"));
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_dir(temp.path()).unwrap();
        let downloader = ModelDownloader::with_cache(cache).unwrap();

        let result = downloader.ensure_model(&TEST_SOURCE).await;
        assert!(matches!(result, Err(RetouchError::Network(_))));
        assert!(!temp.path().join("test-model.onnx.part").exists());
        assert!(!temp.path().join("test-model.onnx").exists());
    }

    #[tokio::test]
    async fn test_explicit_path_wins() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_dir(temp.path()).unwrap();
        let downloader = ModelDownloader::with_cache(cache).unwrap();
        let explicit = PathBuf::from("/models/custom.onnx");

        let path = resolve_model_path(Some(&explicit), &TEST_SOURCE, &downloader)
            .await
            .unwrap();
        assert_eq!(path, explicit);
    }
}
