//! Metadata record describing one stored temp file.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata for a single stored object, separate from its content bytes.
///
/// A record is created exactly once when a file is stored and never mutated
/// afterwards. Record and content are created and removed together as a pair
/// by the owning backend. Backends reconstruct this struct from their native
/// metadata channel (table columns, blob metadata entries, an in-process
/// tuple); a record whose stored metadata is missing or unparsable is treated
/// as absent, not as an error.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TempFile {
    /// Opaque random key assigned at store time. Identity of the object.
    pub key: String,

    /// Display name supplied by the caller. Not used as identity.
    pub filename: String,

    /// Content length in bytes, as measured by the storage medium.
    pub file_size: i64,

    /// True when the object was created through the inbound upload path
    /// rather than by the serving application itself.
    pub is_upload: bool,

    /// Whether a completed download should remove the object.
    pub delete_on_download: bool,

    /// Absolute UTC instant after which the object is expired. An expired
    /// record is invisible to every read path even before a sweep runs.
    pub cache_timeout: DateTime<Utc>,
}

impl TempFile {
    pub fn is_expired(&self) -> bool {
        self.cache_timeout <= Utc::now()
    }
}
