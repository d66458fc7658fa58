//! The single entry point consumers use, regardless of configured backend.
//!
//! `TempFileService` wraps one [`TempStorage`] implementation and layers the
//! defaulting policy on top of the contract: a default time-to-live when the
//! caller supplies none, one-shot streams for plain byte buffers, and the
//! `is_upload = false` / `delete_on_download = true` defaults. It also owns
//! the delete-on-download behavior: a completed full read of a flagged
//! object's content triggers its asynchronous removal.

use crate::{
    models::temp_file::TempFile,
    services::storage::{one_shot, ByteStream, StorageResult, TempStorage},
};
use bytes::Bytes;
use chrono::Duration;
use futures::Stream;
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct TempFileService {
    storage: Arc<dyn TempStorage>,
    default_ttl: Duration,
}

impl TempFileService {
    pub fn new(storage: Arc<dyn TempStorage>, default_ttl: Duration) -> Self {
        Self {
            storage,
            default_ttl,
        }
    }

    /// Store an in-memory buffer with the default TTL and
    /// `delete_on_download = true`.
    pub async fn store_bytes(
        &self,
        filename: &str,
        content: Bytes,
        is_upload: bool,
    ) -> StorageResult<TempFile> {
        self.store_stream(
            filename,
            one_shot(content),
            None,
            is_upload,
            true,
            CancellationToken::new(),
        )
        .await
    }

    /// Store a stream, falling back to the default TTL when none is given.
    pub async fn store_stream<'a>(
        &self,
        filename: &str,
        content: ByteStream<'a>,
        ttl: Option<Duration>,
        is_upload: bool,
        delete_on_download: bool,
        token: CancellationToken,
    ) -> StorageResult<TempFile> {
        self.storage
            .store_stream(
                filename,
                content,
                ttl.unwrap_or(self.default_ttl),
                is_upload,
                delete_on_download,
                token,
            )
            .await
    }

    pub async fn contains_key(&self, key: &str, filter_upload: bool) -> StorageResult<bool> {
        self.storage.contains_key(key, filter_upload).await
    }

    pub async fn file_info(&self, key: &str, filter_upload: bool) -> StorageResult<Option<TempFile>> {
        self.storage.file_info(key, filter_upload).await
    }

    pub async fn content(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.storage.content(key).await
    }

    pub async fn remove(&self, key: &str) -> StorageResult<bool> {
        self.storage.remove(key).await
    }

    pub async fn sweep(&self, token: &CancellationToken) -> StorageResult<u64> {
        self.storage.sweep(token).await
    }

    /// Fetch record and full content for a download. A `delete_on_download`
    /// object is removed asynchronously once its content has been read.
    pub async fn download(&self, key: &str) -> StorageResult<Option<(TempFile, Bytes)>> {
        let Some(info) = self.file_info(key, false).await? else {
            return Ok(None);
        };
        let Some(content) = self.storage.content(key).await? else {
            return Ok(None);
        };

        if info.delete_on_download {
            spawn_remove(self.storage.clone(), key.to_string());
        }

        Ok(Some((info, content)))
    }

    /// Streaming variant of [`download`](Self::download). Removal of a
    /// `delete_on_download` object is triggered only when the returned
    /// stream is read to completion; an abandoned or failed download leaves
    /// the object in place.
    pub async fn open_download(
        &self,
        key: &str,
    ) -> StorageResult<Option<(TempFile, ByteStream<'static>)>> {
        let Some(info) = self.file_info(key, false).await? else {
            return Ok(None);
        };
        let Some(stream) = self.storage.content_stream(key).await? else {
            return Ok(None);
        };

        let stream: ByteStream<'static> = if info.delete_on_download {
            Box::pin(DeleteAfterStream {
                inner: stream,
                storage: self.storage.clone(),
                key: key.to_string(),
                removed: false,
            })
        } else {
            stream
        };

        Ok(Some((info, stream)))
    }
}

fn spawn_remove(storage: Arc<dyn TempStorage>, key: String) {
    tokio::spawn(async move {
        debug!(%key, "removing file after download");
        if let Err(err) = storage.remove(&key).await {
            warn!(%key, "failed to remove file after download: {err}");
        }
    });
}

/// Wraps a content stream and removes the backing object once the inner
/// stream reports exhaustion. Error chunks pass through untouched and do
/// not trigger removal.
struct DeleteAfterStream {
    inner: ByteStream<'static>,
    storage: Arc<dyn TempStorage>,
    key: String,
    removed: bool,
}

impl Stream for DeleteAfterStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                if !this.removed {
                    this.removed = true;
                    spawn_remove(this.storage.clone(), this.key.clone());
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
