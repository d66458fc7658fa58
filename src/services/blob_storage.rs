//! Blob-container storage backend.
//!
//! Each object is a blob in a flat container directory: the content bytes
//! are the blob body under the object key, and every other record field
//! rides alongside as string metadata entries under fixed `tfs_*` names in
//! a `{key}.meta` document within the same container. The expiry instant is
//! encoded as RFC 3339 so it round-trips exactly; metadata that is missing
//! or fails to decode marks the blob as foreign or corrupt and the object
//! reads as absent.

use crate::{
    models::temp_file::TempFile,
    services::{
        key_gen::generate_key,
        storage::{ByteStream, StorageError, StorageLimits, StorageResult, TempStorage},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::debug;
use uuid::Uuid;

const META_SUFFIX: &str = ".meta";
const TMP_PREFIX: &str = ".tmp-";
const META_FILENAME: &str = "tfs_filename";
const META_CACHE_TIMEOUT: &str = "tfs_cache_timeout";
const META_IS_UPLOAD: &str = "tfs_is_upload";
const META_DELETE_ON_DOWNLOAD: &str = "tfs_delete_on_download";

pub struct BlobStorage {
    root: PathBuf,
    limits: StorageLimits,
}

impl BlobStorage {
    /// Open (and create if needed) the container directory.
    ///
    /// Scratch files left behind by writes a previous process never finished
    /// are removed here; no write can be in flight for a container that is
    /// only now being opened.
    pub async fn open(root: impl Into<PathBuf>, limits: StorageLimits) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                debug!(path = %entry.path().display(), "removing stale scratch file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        Ok(Self { root, limits })
    }

    fn content_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{META_SUFFIX}"))
    }

    /// Generated keys are alphanumeric; anything else coming in on a read
    /// path is not one of ours and must not touch the filesystem.
    fn key_is_safe(key: &str) -> bool {
        !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric())
    }

    fn encode_metadata(info: &TempFile) -> HashMap<&'static str, String> {
        HashMap::from([
            (META_FILENAME, info.filename.clone()),
            (META_CACHE_TIMEOUT, info.cache_timeout.to_rfc3339()),
            (META_IS_UPLOAD, info.is_upload.to_string()),
            (META_DELETE_ON_DOWNLOAD, info.delete_on_download.to_string()),
        ])
    }

    /// Decode the metadata document for `key`. Every field is validated;
    /// any missing or unparsable entry means the blob was not produced by
    /// this service (or no longer recognizably so) and yields `None`.
    fn decode_metadata(key: &str, raw: &[u8], file_size: i64) -> Option<TempFile> {
        let entries: HashMap<String, String> = serde_json::from_slice(raw).ok()?;

        let filename = entries.get(META_FILENAME)?.clone();
        let cache_timeout = DateTime::parse_from_rfc3339(entries.get(META_CACHE_TIMEOUT)?)
            .ok()?
            .with_timezone(&Utc);
        let is_upload = entries.get(META_IS_UPLOAD)?.parse().ok()?;
        let delete_on_download = entries.get(META_DELETE_ON_DOWNLOAD)?.parse().ok()?;

        Some(TempFile {
            key: key.to_string(),
            filename,
            file_size,
            is_upload,
            delete_on_download,
            cache_timeout,
        })
    }

    /// Read and decode the metadata document plus the medium-measured
    /// content length. Absent or torn pairs read as `None`.
    async fn read_record(&self, key: &str) -> StorageResult<Option<TempFile>> {
        let raw = match fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let file_size = match fs::metadata(self.content_path(key)).await {
            Ok(meta) => meta.len() as i64,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::Io(err)),
        };

        match Self::decode_metadata(key, &raw, file_size) {
            Some(info) => Ok(Some(info)),
            None => {
                debug!(%key, "undecodable blob metadata, treating as absent");
                Ok(None)
            }
        }
    }

    async fn remove_if_exists(path: &Path) -> StorageResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

/// Removes a scratch file unless the write it belongs to was committed.
///
/// A store future can be dropped at any await point (a disconnecting client
/// drops the handler future); the guard makes sure the half-written
/// `.tmp-*` file does not outlive the write, on error returns and on drop
/// alike.
struct TmpFileGuard {
    path: Option<PathBuf>,
}

impl TmpFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TmpFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl TempStorage for BlobStorage {
    async fn store_stream<'a>(
        &self,
        filename: &str,
        mut content: ByteStream<'a>,
        ttl: Duration,
        is_upload: bool,
        delete_on_download: bool,
        token: CancellationToken,
    ) -> StorageResult<TempFile> {
        let key = generate_key();
        let content_path = self.content_path(&key);
        let tmp_path = self.root.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut tmp_guard = TmpFileGuard::new(tmp_path.clone());

        let mut file = File::create(&tmp_path).await?;
        let mut written = 0u64;

        while let Some(chunk) = content.next().await {
            if token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > self.limits.max_payload_bytes {
                return Err(StorageError::PayloadTooLarge {
                    limit_bytes: self.limits.max_payload_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &content_path).await?;
        tmp_guard.disarm();

        let mut info = TempFile {
            key: key.clone(),
            filename: filename.to_string(),
            file_size: 0,
            is_upload,
            delete_on_download,
            cache_timeout: Utc::now() + ttl,
        };

        // The metadata document is renamed into place last: the object only
        // becomes visible once both halves of the pair exist. A failure here
        // rolls the content back so nothing is partially committed.
        let meta_tmp = self.root.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut meta_guard = TmpFileGuard::new(meta_tmp.clone());
        let meta_bytes = serde_json::to_vec(&Self::encode_metadata(&info))
            .map_err(|err| StorageError::Io(io::Error::new(ErrorKind::Other, err)))?;
        let meta_result = async {
            fs::write(&meta_tmp, &meta_bytes).await?;
            fs::rename(&meta_tmp, self.meta_path(&key)).await
        }
        .await;
        if let Err(err) = meta_result {
            let _ = fs::remove_file(&content_path).await;
            return Err(StorageError::Io(err));
        }
        meta_guard.disarm();

        info.file_size = match fs::metadata(&content_path).await {
            Ok(meta) => meta.len() as i64,
            Err(err) => {
                let _ = self.remove(&key).await;
                return Err(StorageError::Io(err));
            }
        };

        Ok(info)
    }

    async fn file_info(&self, key: &str, filter_upload: bool) -> StorageResult<Option<TempFile>> {
        if !Self::key_is_safe(key) {
            return Ok(None);
        }

        let Some(info) = self.read_record(key).await? else {
            return Ok(None);
        };
        if info.is_expired() || (filter_upload && info.is_upload) {
            return Ok(None);
        }

        Ok(Some(info))
    }

    async fn content(&self, key: &str) -> StorageResult<Option<Bytes>> {
        if self.file_info(key, false).await?.is_none() {
            return Ok(None);
        }

        match fs::read(self.content_path(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn content_stream(&self, key: &str) -> StorageResult<Option<ByteStream<'static>>> {
        if self.file_info(key, false).await?.is_none() {
            return Ok(None);
        }

        // The open handle is owned by the stream and released when the
        // stream is dropped or exhausted, including on error paths.
        match File::open(self.content_path(key)).await {
            Ok(file) => Ok(Some(Box::pin(ReaderStream::new(file)))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        if !Self::key_is_safe(key) {
            return Ok(false);
        }

        // Metadata first: once it is gone the object is invisible even if
        // the content removal races with a reader.
        let meta_removed = Self::remove_if_exists(&self.meta_path(key)).await?;
        let content_removed = Self::remove_if_exists(&self.content_path(key)).await?;

        Ok(meta_removed || content_removed)
    }

    async fn sweep(&self, token: &CancellationToken) -> StorageResult<u64> {
        let mut removed = 0u64;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if token.is_cancelled() {
                break;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(key) = name.strip_suffix(META_SUFFIX) else {
                continue;
            };
            if !Self::key_is_safe(key) {
                continue;
            }

            // Blobs without a parsable timeout were not created by this
            // service; leave them alone.
            let raw = match fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            let entries_map: HashMap<String, String> = match serde_json::from_slice(&raw) {
                Ok(map) => map,
                Err(_) => continue,
            };
            let Some(cache_timeout) = entries_map
                .get(META_CACHE_TIMEOUT)
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            else {
                continue;
            };

            if cache_timeout.with_timezone(&Utc) >= Utc::now() {
                continue;
            }

            if self.remove(key).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }
}
