//! The storage backend contract shared by all media.
//!
//! Every backend (in-process memory, SQLite rows, a blob container on disk)
//! implements [`TempStorage`] with identical visibility semantics: an object
//! that is unknown, expired, upload-filtered, or whose stored metadata cannot
//! be decoded is absent (`None`), never an error. Faults of the medium itself
//! surface as [`StorageError`].

use crate::models::temp_file::TempFile;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Duration;
use futures::{Stream, StreamExt};
use std::{io, pin::Pin};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Upper bound on accepted payload size when none is configured (50 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// A fallible sequence of byte chunks, consumed lazily.
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("payload exceeds the configured maximum of {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: u64 },
    #[error("store cancelled before the payload was fully written")]
    Cancelled,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Limits a backend enforces on writes.
#[derive(Debug, Clone, Copy)]
pub struct StorageLimits {
    pub max_payload_bytes: u64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Contract every storage medium must satisfy identically.
///
/// `file_info` is the single authority for visibility; `contains_key` is a
/// default method delegating to it so expiry and filter logic cannot drift
/// between the two. Content reads (`content`, `content_stream`) never apply
/// upload filtering, only liveness.
#[async_trait]
pub trait TempStorage: Send + Sync {
    /// Consume `content` to completion and persist record + content as one
    /// atomic pair under a freshly generated key. The returned record carries
    /// the byte count actually stored by the medium, never a caller claim.
    ///
    /// A payload over the configured limit fails with
    /// [`StorageError::PayloadTooLarge`] and leaves nothing behind; the same
    /// holds for cancellation and medium faults.
    async fn store_stream<'a>(
        &self,
        filename: &str,
        content: ByteStream<'a>,
        ttl: Duration,
        is_upload: bool,
        delete_on_download: bool,
        token: CancellationToken,
    ) -> StorageResult<TempFile>;

    /// Metadata for a live object, or `None` when the key is unknown, the
    /// record is expired or corrupt, or `filter_upload` excludes it.
    async fn file_info(&self, key: &str, filter_upload: bool) -> StorageResult<Option<TempFile>>;

    /// True iff `file_info` would return a record.
    async fn contains_key(&self, key: &str, filter_upload: bool) -> StorageResult<bool> {
        Ok(self.file_info(key, filter_upload).await?.is_some())
    }

    /// Full content of a live object. No upload filtering.
    async fn content(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Lazily consumed content of a live object. Resources backing the
    /// stream are released when it is dropped or exhausted.
    async fn content_stream(&self, key: &str) -> StorageResult<Option<ByteStream<'static>>>;

    /// Remove record and content together. Returns whether anything was
    /// actually removed; removing an unknown key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Purge objects whose expiry has passed. Returns the number removed.
    /// Safe to run concurrently with reads and writes; never removes a
    /// non-expired object.
    async fn sweep(&self, token: &CancellationToken) -> StorageResult<u64>;
}

/// Drain a stream into memory, enforcing the payload limit chunk by chunk
/// and honoring cancellation between chunks. Used by the backends that
/// buffer before a single-shot write to their medium.
pub(crate) async fn read_to_buffer(
    mut content: ByteStream<'_>,
    limits: StorageLimits,
    token: &CancellationToken,
) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = content.next().await {
        if token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limits.max_payload_bytes {
            return Err(StorageError::PayloadTooLarge {
                limit_bytes: limits.max_payload_bytes,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Wrap an in-memory buffer as a one-shot [`ByteStream`].
pub fn one_shot(content: Bytes) -> ByteStream<'static> {
    Box::pin(futures::stream::once(async move {
        Ok::<_, io::Error>(content)
    }))
}
