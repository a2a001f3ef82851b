//! Storage layer for the device topics engine.
//!
//! Provides RocksDB-backed storage with:
//! - One column family per logical table
//! - Epoch-prefixed keys so forward scans are epoch ordered
//! - Atomic multi-table writes via `StorageBatch`
//! - Epoch-range reads used by garbage collection and the cache

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use column_families::TopicsTable;
pub use db::{Storage, StorageBatch, StorageStats};
pub use error::StorageError;
