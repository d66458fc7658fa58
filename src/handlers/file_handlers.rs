//! HTTP handlers for temp file upload and download.
//! Thin adapters over `TempFileService`: multipart parts are streamed into
//! storage without buffering, and downloads stream back out of it.

use crate::{errors::AppError, services::temp_file_service::TempFileService};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::sync::CancellationToken;

/// One stored file in the upload response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFileInfo {
    pub key: String,
    pub file_name: String,
    pub file_size: i64,
}

/// Query params accepted by the download endpoint.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub key: String,
}

/// POST the configured upload path — multipart upload.
///
/// Every file part is streamed into storage with `is_upload = true` and the
/// default TTL; the response lists the assigned keys.
pub async fn upload_file(
    State(service): State<TempFileService>,
    mut multipart: Multipart,
) -> Result<Json<Vec<StoredFileInfo>>, AppError> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, format!("invalid multipart body: {err}"))
    })? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            // Non-file form fields are drained and ignored.
            continue;
        };

        let stream = field.map(|chunk| {
            chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        });

        let stored = service
            .store_stream(
                &file_name,
                Box::pin(stream),
                None,
                true,
                true,
                CancellationToken::new(),
            )
            .await?;

        files.push(StoredFileInfo {
            key: stored.key,
            file_name,
            file_size: stored.file_size,
        });
    }

    Ok(Json(files))
}

/// GET the configured download path — `?key=` streams the file back.
///
/// Upload-flagged files are not served from this endpoint; the key check
/// runs with `filter_upload = true`. A completed download of a
/// delete-on-download file removes it.
pub async fn download_file(
    State(service): State<TempFileService>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    if !service.contains_key(&query.key, true).await? {
        return Err(AppError::not_found("download key is unknown or expired"));
    }

    let Some((info, stream)) = service.open_download(&query.key).await? else {
        return Err(AppError::not_found("download key is unknown or expired"));
    };

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&info.file_size.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    let disposition = format!(
        "attachment; filename=\"{}\"",
        info.filename.replace(['"', '\r', '\n'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    *response.status_mut() = StatusCode::OK;

    Ok(response)
}
