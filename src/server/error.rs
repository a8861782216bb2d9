//! HTTP error responses
//!
//! Every failure leaves the server as `{"detail": message, "code": CODE}`.

use crate::error::RetouchError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error type returned by request handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Retouch(#[from] RetouchError),

    /// Malformed request outside the domain errors (multipart, query string)
    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Status, machine-readable code and client-facing message
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            Self::Retouch(err) => match err {
                RetouchError::NotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("Job not found: {id}"),
                ),
                RetouchError::InvalidState(msg) => {
                    (StatusCode::BAD_REQUEST, "INVALID_STATE", msg.clone())
                },
                RetouchError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                },
                RetouchError::Image(e) => (
                    StatusCode::BAD_REQUEST,
                    "INVALID_IMAGE",
                    format!("Could not decode image: {e}"),
                ),
                other => {
                    tracing::error!(error = %other, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        other.to_string(),
                    )
                },
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = self.classify();
        (status, Json(json!({ "detail": detail, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_not_found_is_404() {
        let (status, body) = render(RetouchError::job_not_found("abc").into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["detail"], "Job not found: abc");
    }

    #[tokio::test]
    async fn test_client_errors_are_400() {
        for err in [
            RetouchError::invalid_state("Job is still processing"),
            RetouchError::validation("extend_left too large"),
        ] {
            let (status, _) = render(err.into()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        let decode = image::load_from_memory(b"nope").unwrap_err();
        let (status, body) = render(RetouchError::from(decode).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_IMAGE");

        let (status, body) = render(AppError::BadRequest("Missing field 'image'".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Missing field 'image'");
    }

    #[tokio::test]
    async fn test_server_errors_are_500() {
        let (status, body) = render(RetouchError::inference("CUDA out of memory").into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "INTERNAL_ERROR");
        assert!(body["detail"].as_str().unwrap().contains("CUDA out of memory"));
    }
}
