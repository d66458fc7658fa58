//! Core data model for the temp file store.
//!
//! A stored object is described by a [`temp_file::TempFile`] record; the
//! content bytes live in whichever storage backend is configured and are
//! addressed by the record's key.

pub mod temp_file;
