//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that round-trips a probe file through storage

use crate::services::temp_file_service::TempFileService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that stores a tiny probe file in the configured backend,
/// reads it back, and removes it again. Works identically for every backend
/// since it only uses the storage contract.
///
/// Returns JSON describing the check. HTTP 200 when it passes, HTTP 503 when
/// it fails.
pub async fn readyz(State(service): State<TempFileService>) -> impl IntoResponse {
    let storage_check = probe_storage(&service).await;

    let storage_ok = storage_check.is_none();
    let mut checks = HashMap::new();
    checks.insert(
        "storage",
        CheckStatus {
            ok: storage_ok,
            error: storage_check,
        },
    );

    let body = ReadyResponse {
        status: if storage_ok { "ok".into() } else { "error".into() },
        checks,
    };

    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Store/read/remove round trip. Returns `None` on success, or a message
/// describing the first failing step.
async fn probe_storage(service: &TempFileService) -> Option<String> {
    let stored = match service
        .store_bytes(".readyz", Bytes::from_static(b"readyz"), false)
        .await
    {
        Ok(stored) => stored,
        Err(err) => return Some(format!("could not store probe file: {err}")),
    };

    let outcome = match service.content(&stored.key).await {
        Ok(Some(content)) if &content[..] == b"readyz" => None,
        Ok(Some(_)) => Some("probe file content mismatch".to_string()),
        Ok(None) => Some("probe file missing after store".to_string()),
        Err(err) => Some(format!("could not read probe file: {err}")),
    };

    // Best-effort cleanup; report the failure only when the probe itself
    // passed.
    match service.remove(&stored.key).await {
        Ok(_) => outcome,
        Err(err) => outcome.or(Some(format!("could not remove probe file: {err}"))),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
