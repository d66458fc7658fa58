//! Relational storage backend on SQLite.
//!
//! One row per object in `temp_files`, with the content held in a BLOB
//! column so metadata and payload travel together. The table may be shared
//! with other writers and can grow large, so the sweep uses the batched
//! one-row-at-a-time deletion strategy under a wall-clock budget instead of
//! scanning the whole table.

use crate::{
    models::temp_file::TempFile,
    services::{
        key_gen::generate_key,
        storage::{read_to_buffer, ByteStream, StorageLimits, StorageResult, TempStorage},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::stream;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::{
    io::{self, ErrorKind},
    sync::Arc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Page size for streamed content reads out of the BLOB column.
const STREAM_CHUNK_BYTES: i64 = 256 * 1024;

/// Wall-clock ceiling for one sweep cycle; the loop resumes on the next
/// scheduled sweep.
const SWEEP_BUDGET_SECS: u64 = 60;

pub struct SqlStorage {
    db: Arc<SqlitePool>,
    limits: StorageLimits,
}

impl SqlStorage {
    pub fn new(db: Arc<SqlitePool>, limits: StorageLimits) -> Self {
        Self { db, limits }
    }

    /// Decode a row into a record, tolerating malformed column data.
    ///
    /// The table may hold rows written by an older or incompatible version;
    /// a row that does not decode is treated as absent rather than surfaced
    /// as a fault.
    fn decode_row(row: &SqliteRow) -> Option<TempFile> {
        Some(TempFile {
            key: row.try_get("key").ok()?,
            filename: row.try_get("filename").ok()?,
            file_size: row.try_get("file_size").ok()?,
            is_upload: row.try_get("is_upload").ok()?,
            delete_on_download: row.try_get("delete_on_download").ok()?,
            cache_timeout: row.try_get::<DateTime<Utc>, _>("cache_timeout").ok()?,
        })
    }
}

#[async_trait]
impl TempStorage for SqlStorage {
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

        let key = generate_key();
        let cache_timeout = Utc::now() + ttl;

        // Record and content commit in one statement; the size the medium
        // reports back is authoritative, not the buffered length.
        let stored_len: i64 = sqlx::query_scalar(
            "INSERT INTO temp_files
                 (key, filename, file_size, is_upload, delete_on_download, cache_timeout, content)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING length(content)",
        )
        .bind(&key)
        .bind(filename)
        .bind(content.len() as i64)
        .bind(is_upload)
        .bind(delete_on_download)
        .bind(cache_timeout)
        .bind(&content[..])
        .fetch_one(&*self.db)
        .await?;

        Ok(TempFile {
            key,
            filename: filename.to_string(),
            file_size: stored_len,
            is_upload,
            delete_on_download,
            cache_timeout,
        })
    }

    async fn file_info(&self, key: &str, filter_upload: bool) -> StorageResult<Option<TempFile>> {
        let query = if filter_upload {
            "SELECT key, filename, file_size, is_upload, delete_on_download, cache_timeout
             FROM temp_files WHERE key = ? AND cache_timeout > ? AND is_upload = 0"
        } else {
            "SELECT key, filename, file_size, is_upload, delete_on_download, cache_timeout
             FROM temp_files WHERE key = ? AND cache_timeout > ?"
        };

        let row = sqlx::query(query)
            .bind(key)
            .bind(Utc::now())
            .fetch_optional(&*self.db)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let Some(info) = Self::decode_row(&row) else {
            debug!(%key, "undecodable row in temp_files, treating as absent");
            return Ok(None);
        };

        // Re-check expiry on the decoded value rather than trusting the
        // textual comparison alone.
        if info.is_expired() {
            return Ok(None);
        }

        Ok(Some(info))
    }

    async fn content(&self, key: &str) -> StorageResult<Option<Bytes>> {
        if self.file_info(key, false).await?.is_none() {
            return Ok(None);
        }

        let content: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content FROM temp_files WHERE key = ?")
                .bind(key)
                .fetch_optional(&*self.db)
                .await?;

        Ok(content.map(Bytes::from))
    }

    async fn content_stream(&self, key: &str) -> StorageResult<Option<ByteStream<'static>>> {
        let Some(info) = self.file_info(key, false).await? else {
            return Ok(None);
        };

        // Page the BLOB out of the row instead of materializing it at once.
        // Each page is its own query through the pool, so the stream holds
        // no connection between polls.
        let db = self.db.clone();
        let key = key.to_string();
        let total_len = info.file_size;

        let paged = stream::try_unfold(0i64, move |offset| {
            let db = db.clone();
            let key = key.clone();
            async move {
                if offset >= total_len {
                    return Ok(None);
                }

                let chunk: Option<Vec<u8>> = sqlx::query_scalar(
                    "SELECT substr(content, ?, ?) FROM temp_files WHERE key = ?",
                )
                .bind(offset + 1)
                .bind(STREAM_CHUNK_BYTES)
                .bind(&key)
                .fetch_optional(&*db)
                .await
                .map_err(|err| io::Error::new(ErrorKind::Other, err))?;

                let chunk = chunk.ok_or_else(|| {
                    io::Error::new(ErrorKind::Other, "row removed during streamed read")
                })?;
                if chunk.is_empty() {
                    return Ok(None);
                }

                let next_offset = offset + chunk.len() as i64;
                Ok(Some((Bytes::from(chunk), next_offset)))
            }
        });

        Ok(Some(Box::pin(paged)))
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM temp_files WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sweep(&self, token: &CancellationToken) -> StorageResult<u64> {
        let started = Instant::now();
        let mut removed = 0u64;

        // Delete one expired row at a time so a sweep over a large shared
        // table stays cheap and interruptible.
        loop {
            if token.is_cancelled() || started.elapsed().as_secs() >= SWEEP_BUDGET_SECS {
                break;
            }

            let result = sqlx::query(
                "DELETE FROM temp_files WHERE rowid IN
                     (SELECT rowid FROM temp_files WHERE cache_timeout < ? LIMIT 1)",
            )
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                break;
            }
            removed += result.rows_affected();
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{one_shot, StorageError};
    use futures::StreamExt;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_storage() -> SqlStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");

        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.expect("migration");
        }

        SqlStorage::new(Arc::new(pool), StorageLimits::default())
    }

    async fn store(
        storage: &SqlStorage,
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
    async fn stored_row_reports_medium_measured_size() {
        let storage = test_storage().await;
        let info = store(&storage, "a.txt", b"hello", Duration::hours(1), false).await;

        assert_eq!(info.file_size, 5);

        let fetched = storage.file_info(&info.key, false).await.unwrap().unwrap();
        assert_eq!(fetched.filename, "a.txt");
        assert_eq!(fetched.file_size, 5);
        assert!(!fetched.is_upload);
        assert!(fetched.delete_on_download);

        let content = storage.content(&info.key).await.unwrap().unwrap();
        assert_eq!(&content[..], b"hello");
    }

    #[tokio::test]
    async fn content_stream_pages_large_blobs() {
        let storage = test_storage().await;
        let payload: Vec<u8> = (0..STREAM_CHUNK_BYTES as usize * 2 + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        let info = store(&storage, "big.bin", &payload, Duration::hours(1), false).await;
        assert_eq!(info.file_size, payload.len() as i64);

        let mut stream = storage.content_stream(&info.key).await.unwrap().unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn unknown_key_is_absent_everywhere() {
        let storage = test_storage().await;
        assert!(storage.file_info("nope", false).await.unwrap().is_none());
        assert!(storage.content("nope").await.unwrap().is_none());
        assert!(storage.content_stream("nope").await.unwrap().is_none());
        assert!(!storage.contains_key("nope", false).await.unwrap());
    }

    #[tokio::test]
    async fn expired_row_is_invisible_before_any_sweep() {
        let storage = test_storage().await;
        let info = store(&storage, "old.bin", b"stale", Duration::seconds(-1), false).await;

        assert!(storage.file_info(&info.key, false).await.unwrap().is_none());
        assert!(storage.content(&info.key).await.unwrap().is_none());
        assert!(storage.content_stream(&info.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filter_upload_excludes_upload_flagged_rows() {
        let storage = test_storage().await;
        let uploaded = store(&storage, "up.txt", b"x", Duration::hours(1), true).await;
        let internal = store(&storage, "in.txt", b"x", Duration::hours(1), false).await;

        assert!(!storage.contains_key(&uploaded.key, true).await.unwrap());
        assert!(storage.contains_key(&uploaded.key, false).await.unwrap());
        assert!(storage.contains_key(&internal.key, true).await.unwrap());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let storage = test_storage().await;
        let info = store(&storage, "a.txt", b"12345", Duration::hours(1), false).await;

        assert!(storage.remove(&info.key).await.unwrap());
        assert!(!storage.remove(&info.key).await.unwrap());
        assert!(storage.file_info(&info.key, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_without_residue() {
        let storage = SqlStorage {
            limits: StorageLimits {
                max_payload_bytes: 4,
            },
            ..test_storage().await
        };

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

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM temp_files")
            .fetch_one(&*storage.db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn undecodable_row_reads_as_absent() {
        let storage = test_storage().await;
        sqlx::query(
            "INSERT INTO temp_files
                 (key, filename, file_size, is_upload, delete_on_download, cache_timeout, content)
             VALUES ('corruptkey', 'x', 1, 0, 1, 'zzz-not-a-timestamp', x'00')",
        )
        .execute(&*storage.db)
        .await
        .unwrap();

        assert!(storage.file_info("corruptkey", false).await.unwrap().is_none());
        assert!(storage.content("corruptkey").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_deletes_expired_rows_in_batches() {
        let storage = test_storage().await;
        let mut expired = Vec::new();
        for i in 0..3 {
            expired.push(
                store(
                    &storage,
                    &format!("old-{i}.txt"),
                    b"x",
                    Duration::seconds(-1),
                    false,
                )
                .await,
            );
        }
        let live = store(&storage, "new.txt", b"keep", Duration::hours(1), false).await;

        let removed = storage.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(removed, 3);

        for info in expired {
            let count: i64 =
                sqlx::query_scalar("SELECT count(*) FROM temp_files WHERE key = ?")
                    .bind(&info.key)
                    .fetch_one(&*storage.db)
                    .await
                    .unwrap();
            assert_eq!(count, 0);
        }

        let content = storage.content(&live.key).await.unwrap().unwrap();
        assert_eq!(&content[..], b"keep");
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_early() {
        let storage = test_storage().await;
        store(&storage, "old.txt", b"x", Duration::seconds(-1), false).await;

        let token = CancellationToken::new();
        token.cancel();
        let removed = storage.sweep(&token).await.unwrap();
        assert_eq!(removed, 0);
    }
}
