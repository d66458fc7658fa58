//! Defines routes for the temp file store.
//!
//! ## Structure
//! - `POST {upload_path}`      — multipart upload (default `/upload-file`)
//! - `GET  {download_path}?key=` — streamed download (default `/download-file`)
//! - `GET  /healthz`           — liveness
//! - `GET  /readyz`            — readiness
//!
//! The upload and download paths are configurable so the service can be
//! mounted under application-specific routes.

use crate::{
    config::AppConfig,
    handlers::{
        file_handlers::{download_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::temp_file_service::TempFileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all temp file routes.
///
/// The router carries shared state (`TempFileService`) to all handlers. The
/// request body limit follows the configured maximum payload size; the
/// storage layer enforces its own limit as well so an oversized upload is
/// rejected as "payload too large" rather than truncated.
pub fn routes(cfg: &AppConfig) -> Router<TempFileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // file endpoints
        .route(&cfg.upload_path, post(upload_file))
        .route(&cfg.download_path, get(download_file))
        .layer(DefaultBodyLimit::max(cfg.max_payload_bytes as usize))
}
