//! In-process heap storage backend.
//!
//! Records and content live together in one map guarded by an async RwLock,
//! so store/remove of a single key is atomic with respect to concurrent
//! readers. The payload is buffered before the lock is taken; the critical
//! sections never await.

use crate::{
    models::temp_file::TempFile,
    services::{
        key_gen::generate_key,
        storage::{read_to_buffer, ByteStream, StorageLimits, StorageResult, TempStorage},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct StoredFile {
    info: TempFile,
    content: Bytes,
}

pub struct MemoryStorage {
    files: RwLock<HashMap<String, StoredFile>>,
    limits: StorageLimits,
}

impl MemoryStorage {
    pub fn new(limits: StorageLimits) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            limits,
        }
    }
}

#[async_trait]
impl TempStorage for MemoryStorage {
    async fn store_stream<'a>(
        &self,
        filename: &str,
        content: ByteStream<'a>,
        ttl: Duration,
        is_upload: bool,
        delete_on_download: bool,
        token: CancellationToken,
    ) -> StorageResult<TempFile> {
        let content = read_to_buffer(content, self.limits, &token).await?;

        let info = TempFile {
            key: generate_key(),
            filename: filename.to_string(),
            file_size: content.len() as i64,
            is_upload,
            delete_on_download,
            cache_timeout: Utc::now() + ttl,
        };

        let mut files = self.files.write().await;
        files.insert(
            info.key.clone(),
            StoredFile {
                info: info.clone(),
                content,
            },
        );

        Ok(info)
    }

    async fn file_info(&self, key: &str, filter_upload: bool) -> StorageResult<Option<TempFile>> {
        let files = self.files.read().await;
        let info = match files.get(key) {
            Some(stored) => &stored.info,
            None => return Ok(None),
        };

        if info.is_expired() || (filter_upload && info.is_upload) {
            return Ok(None);
        }

        Ok(Some(info.clone()))
    }

    async fn content(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let files = self.files.read().await;
        Ok(files
            .get(key)
            .filter(|stored| !stored.info.is_expired())
            .map(|stored| stored.content.clone()))
    }

    async fn content_stream(&self, key: &str) -> StorageResult<Option<ByteStream<'static>>> {
        Ok(self
            .content(key)
            .await?
            .map(crate::services::storage::one_shot))
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let mut files = self.files.write().await;
        Ok(files.remove(key).is_some())
    }

    async fn sweep(&self, token: &CancellationToken) -> StorageResult<u64> {
        if token.is_cancelled() {
            return Ok(0);
        }

        let mut files = self.files.write().await;
        let before = files.len();
        files.retain(|_, stored| !stored.info.is_expired());
        Ok((before - files.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{one_shot, StorageError};

    fn storage() -> MemoryStorage {
        MemoryStorage::new(StorageLimits::default())
    }

    async fn store(
        storage: &MemoryStorage,
        filename: &str,
        content: &[u8],
        ttl: Duration,
        is_upload: bool,
    ) -> TempFile {
        storage
            .store_stream(
                filename,
                one_shot(Bytes::copy_from_slice(content)),
                ttl,
                is_upload,
                true,
                CancellationToken::new(),
            )
            .await
            .expect("store failed")
    }

    #[tokio::test]
    async fn stored_file_is_readable_with_exact_content() {
        let storage = storage();
        let info = store(&storage, "a.txt", b"hello", Duration::hours(1), false).await;

        assert_eq!(info.filename, "a.txt");
        assert_eq!(info.file_size, 5);

        let fetched = storage.file_info(&info.key, false).await.unwrap().unwrap();
        assert_eq!(fetched, info);

        let content = storage.content(&info.key).await.unwrap().unwrap();
        assert_eq!(&content[..], b"hello");

        let mut stream = storage.content_stream(&info.key).await.unwrap().unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = futures::StreamExt::next(&mut stream).await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");
    }

    #[tokio::test]
    async fn unknown_key_is_absent_everywhere() {
        let storage = storage();
        assert!(storage.file_info("nope", false).await.unwrap().is_none());
        assert!(storage.content("nope").await.unwrap().is_none());
        assert!(storage.content_stream("nope").await.unwrap().is_none());
        assert!(!storage.contains_key("nope", false).await.unwrap());
    }

    #[tokio::test]
    async fn expired_file_is_invisible_before_any_sweep() {
        let storage = storage();
        let info = store(&storage, "old.bin", b"stale", Duration::seconds(-1), false).await;

        assert!(storage.file_info(&info.key, false).await.unwrap().is_none());
        assert!(!storage.contains_key(&info.key, false).await.unwrap());
        assert!(storage.content(&info.key).await.unwrap().is_none());
        assert!(storage.content_stream(&info.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let storage = storage();
        let info = store(&storage, "a.txt", b"12345", Duration::hours(1), false).await;

        assert_eq!(
            storage.file_info(&info.key, false).await.unwrap().unwrap().file_size,
            5
        );
        assert!(storage.remove(&info.key).await.unwrap());
        assert!(!storage.remove(&info.key).await.unwrap());
        assert!(storage.file_info(&info.key, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filter_upload_excludes_upload_flagged_files() {
        let storage = storage();
        let uploaded = store(&storage, "up.txt", b"x", Duration::hours(1), true).await;
        let internal = store(&storage, "in.txt", b"x", Duration::hours(1), false).await;

        assert!(!storage.contains_key(&uploaded.key, true).await.unwrap());
        assert!(storage.contains_key(&uploaded.key, false).await.unwrap());
        assert!(storage.contains_key(&internal.key, true).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_without_residue() {
        let storage = MemoryStorage::new(StorageLimits {
            max_payload_bytes: 4,
        });
        let result = storage
            .store_stream(
                "big.bin",
                one_shot(Bytes::from_static(b"too large")),
                Duration::hours(1),
                false,
                true,
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(StorageError::PayloadTooLarge { limit_bytes: 4 })
        ));
        let files = storage.files.read().await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn cancelled_store_leaves_nothing_behind() {
        let storage = storage();
        let token = CancellationToken::new();
        token.cancel();

        let result = storage
            .store_stream(
                "c.bin",
                one_shot(Bytes::from_static(b"data")),
                Duration::hours(1),
                false,
                true,
                token,
            )
            .await;

        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert!(storage.files.read().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_files() {
        let storage = storage();
        let expired = store(&storage, "old.txt", b"x", Duration::seconds(-1), false).await;
        let live = store(&storage, "new.txt", b"y", Duration::hours(1), false).await;

        let removed = storage.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(removed, 1);

        let files = storage.files.read().await;
        assert!(!files.contains_key(&expired.key));
        assert!(files.contains_key(&live.key));
        drop(files);

        let content = storage.content(&live.key).await.unwrap().unwrap();
        assert_eq!(&content[..], b"y");
    }
}
