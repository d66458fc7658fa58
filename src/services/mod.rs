//! Storage contract, backends, facade, and background eviction.

pub mod blob_storage;
pub mod key_gen;
pub mod memory_storage;
pub mod sql_storage;
pub mod storage;
pub mod sweeper;
pub mod temp_file_service;
