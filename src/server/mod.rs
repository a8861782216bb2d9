//! HTTP surface
//!
//! The router is built from explicitly constructed [`AppState`]; nothing is global,
//! so tests build the same router around mock backends.

mod error;
mod handlers;

pub use error::{AppError, AppResult};
pub use handlers::BATCH_ARCHIVE_NAME;

use crate::error::{RetouchError, Result};
use crate::jobs::JobTracker;
use crate::manager::SharedManager;
use crate::processor::RetouchProcessor;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, Any as CorsAny, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Network and HTTP limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed origins; a single `*` allows any origin
    pub cors_origins: Vec<String>,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            max_upload_mb: 50,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// # Errors
    /// - Host is not an IP address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self.host.parse().map_err(|e| {
            RetouchError::invalid_config(format!("Invalid HOST '{}': {}", self.host, e))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub processor: RetouchProcessor,
    pub jobs: JobTracker,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Build processor and job tracker around one shared manager
    #[must_use]
    pub fn new(manager: SharedManager, config: ServerConfig) -> Self {
        Self {
            processor: RetouchProcessor::new(Arc::clone(&manager)),
            jobs: JobTracker::new(manager),
            config: Arc::new(config),
        }
    }
}

/// Routes plus middleware
///
/// # Errors
/// - A configured CORS origin is not a valid header value
pub fn router(state: AppState) -> Result<Router> {
    let cors = build_cors_layer(&state.config.cors_origins)?;
    let body_limit = state.config.max_upload_bytes();

    Ok(Router::new()
        .route("/", get(handlers::health))
        .route("/device", get(handlers::device))
        .route("/models", get(handlers::models))
        .route("/inpaint", post(handlers::submit_inpaint))
        .route("/jobs/{job_id}", get(handlers::job_status))
        .route("/results/{job_id}", get(handlers::job_result))
        .route("/detect-objects", post(handlers::detect_objects))
        .route("/refine-edges", post(handlers::refine_edges))
        .route("/remove-background", post(handlers::remove_background))
        .route("/replace-background", post(handlers::replace_background))
        .route("/auto-mask", post(handlers::auto_mask))
        .route("/outpaint", post(handlers::outpaint))
        .route("/batch-inpaint", post(handlers::batch_inpaint))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
        .with_state(state))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %message, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "Internal server error", "code": "INTERNAL_ERROR" })),
    )
        .into_response()
}

/// CORS for the configured origins
///
/// A wildcard cannot be combined with credentials, so `*` gets a permissive layer
/// without them and explicit origins get credentials.
fn build_cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let max_age = Duration::from_secs(3600);
    if origins.is_empty() || origins.iter().any(|origin| origin.trim() == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(CorsAny)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(CorsAny)
            .max_age(max_age));
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin.trim()).map_err(|e| {
                RetouchError::invalid_config(format!("Invalid CORS origin '{origin}': {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::list([header::CONTENT_TYPE, header::AUTHORIZATION]))
        .allow_credentials(true)
        .max_age(max_age))
}

/// Bind and serve until SIGINT or SIGTERM
///
/// # Errors
/// - Invalid bind address or CORS configuration
/// - The listener cannot be bound
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.socket_addr()?;
    let app = router(state)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RetouchError::file_io_error("bind", addr.to_string(), &e))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
