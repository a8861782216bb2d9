//! Error types for retouching operations

use thiserror::Error;

/// Result type alias for retouching operations
pub type Result<T> = std::result::Result<T, RetouchError>;

/// Error types for retouching operations
#[derive(Error, Debug)]
pub enum RetouchError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding, encoding or format errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration, or an optional backend that is not available
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model loading or initialization errors
    #[error("Model error: {0}")]
    Model(String),

    /// Geometry or tensor processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// Caller supplied parameters outside their valid range
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown job identifier
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Operation requested in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Network errors during model download
    #[error("Network error: {0}")]
    Network(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RetouchError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not-found error for a job identifier
    pub fn job_not_found<S: std::fmt::Display>(job_id: S) -> Self {
        Self::NotFound(job_id.to_string())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a network error with the underlying cause
    pub fn network_error<E: std::fmt::Display>(context: impl Into<String>, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        Self::Io(std::io::Error::new(
            error.kind(),
            format!(
                "Failed to {} '{}': {}",
                operation,
                path.as_ref().display(),
                error
            ),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::Validation(format!(
            "Invalid {}: {} (valid range: {})",
            parameter, value, valid_range
        ))
    }

    /// Create inference error with device context
    pub fn inference_error_with_device(device: &str, operation: &str, error: &str) -> Self {
        Self::Inference(format!(
            "{} failed on '{}' device: {}",
            operation, device, error
        ))
    }

    /// Whether the failure was caused by the caller rather than the service
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidState(_) | Self::NotFound(_) | Self::Image(_)
        )
    }
}

impl From<tokio::task::JoinError> for RetouchError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            Self::Internal("Inference worker panicked".to_string())
        } else {
            Self::Internal(format!("Inference worker did not finish: {}", error))
        }
    }
}
