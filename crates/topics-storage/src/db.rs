//! RocksDB wrapper for topics storage.
//!
//! Provides:
//! - Database open with column family setup
//! - Atomic multi-table write batches
//! - Single-key, prefix and epoch-range reads
//! - Admin operations (stats, compaction, flush)

use std::collections::BTreeMap;
use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, ALL_CF_NAMES};
use crate::error::StorageError;
use crate::keys::{epoch_of_key, epoch_prefix};
use topics_types::EpochId;

/// One pending mutation in a `StorageBatch`.
#[derive(Debug, Clone)]
enum BatchOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
}

/// Mutations across column families, applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct StorageBatch {
    ops: Vec<BatchOp>,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, cf_name: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            cf: cf_name.to_string(),
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a delete.
    pub fn delete(&mut self, cf_name: &str, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            cf: cf_name.to_string(),
            key: key.into(),
        });
    }

    /// Append another batch's mutations after this one's.
    pub fn extend(&mut self, other: StorageBatch) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Main storage interface
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open storage at the given path, creating it and any missing
    /// column families if necessary.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        Ok(Self { db })
    }

    fn cf(&self, cf_name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))
    }

    // ===== Generic Column Family Operations =====

    /// Put a value into a specific column family.
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    /// Get a value from a specific column family.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(cf_name)?;
        let result = self.db.get_cf(cf, key)?;
        Ok(result)
    }

    /// Delete a value from a specific column family.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    /// Entries whose key starts with `prefix`, in key order.
    #[allow(clippy::type_complexity)]
    pub fn prefix_iterator(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cf = self.cf(cf_name)?;

        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }

        Ok(results)
    }

    /// Every entry of a column family, in key order.
    #[allow(clippy::type_complexity)]
    pub fn scan(&self, cf_name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    /// Entries of an epoch-keyed column family with epoch in `[lower, upper]`.
    ///
    /// A negative lower bound is clamped to 0; an empty range returns nothing.
    #[allow(clippy::type_complexity)]
    pub fn epoch_range(
        &self,
        cf_name: &str,
        lower: EpochId,
        upper: EpochId,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let lower = lower.max(0);
        if upper < lower {
            return Ok(Vec::new());
        }

        let cf = self.cf(cf_name)?;
        let start = epoch_prefix(lower)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if epoch_of_key(&key)? > upper {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }

        Ok(results)
    }

    /// Keys of an epoch-keyed column family with epoch `<= epoch_to_delete_from`.
    pub fn keys_up_to_epoch(
        &self,
        cf_name: &str,
        epoch_to_delete_from: EpochId,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        if epoch_to_delete_from < 0 {
            return Ok(Vec::new());
        }
        let cf = self.cf(cf_name)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if epoch_of_key(&key)? > epoch_to_delete_from {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Apply a batch atomically. Returns the number of mutations written.
    pub fn write_batch(&self, batch: StorageBatch) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let mut write_batch = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    write_batch.put_cf(self.cf(&cf)?, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    write_batch.delete_cf(self.cf(&cf)?, key);
                }
            }
        }

        self.db.write(write_batch)?;
        debug!(mutations = count, "Applied storage batch");
        Ok(count)
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }

    // ===== Admin Operations =====

    /// Trigger manual compaction on all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction...");
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.compact_range_cf::<&[u8], &[u8]>(cf, None, None);
            }
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Trigger compaction on a specific column family.
    pub fn compact_cf(&self, cf_name: &str) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        info!(cf = %cf_name, "Starting compaction...");
        self.db.compact_range_cf::<&[u8], &[u8]>(cf, None, None);
        info!(cf = %cf_name, "Compaction complete");
        Ok(())
    }

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        for cf_name in ALL_CF_NAMES {
            let cf = self.cf(cf_name)?;
            stats
                .row_counts
                .insert(cf_name.to_string(), self.count_cf_entries(cf)?);
        }
        stats.disk_usage_bytes = self.get_disk_usage();
        Ok(stats)
    }

    fn count_cf_entries(&self, cf: &rocksdb::ColumnFamily) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> u64 {
        let mut total_size = 0u64;
        if let Ok(entries) = std::fs::read_dir(self.db.path()) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }
        total_size
    }
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Row count per column family
    pub row_counts: BTreeMap<String, u64>,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}

impl StorageStats {
    pub fn rows(&self, cf_name: &str) -> u64 {
        self.row_counts.get(cf_name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::{CF_RETURNED_TOPICS, CF_TOP_TOPICS, CF_USAGE_HISTORY};
    use crate::keys::epoch_key;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_put_get_delete() {
        let (storage, _temp) = create_test_storage();
        storage.put(CF_TOP_TOPICS, b"k", b"v").unwrap();
        assert_eq!(storage.get(CF_TOP_TOPICS, b"k").unwrap(), Some(b"v".to_vec()));

        storage.delete(CF_TOP_TOPICS, b"k").unwrap();
        assert_eq!(storage.get(CF_TOP_TOPICS, b"k").unwrap(), None);
    }

    #[test]
    fn test_unknown_cf() {
        let (storage, _temp) = create_test_storage();
        let result = storage.get("nope", b"k");
        assert!(matches!(result, Err(StorageError::ColumnFamilyNotFound(_))));
    }

    #[test]
    fn test_epoch_range_inclusive() {
        let (storage, _temp) = create_test_storage();
        for epoch in 0..6 {
            let key = epoch_key(epoch, &["app"]).unwrap();
            storage.put(CF_USAGE_HISTORY, &key, b"x").unwrap();
        }

        let rows = storage.epoch_range(CF_USAGE_HISTORY, 2, 4).unwrap();
        let epochs: Vec<EpochId> = rows.iter().map(|(k, _)| epoch_of_key(k).unwrap()).collect();
        assert_eq!(epochs, vec![2, 3, 4]);

        // Negative lower bound clamps to 0
        assert_eq!(storage.epoch_range(CF_USAGE_HISTORY, -3, 1).unwrap().len(), 2);
        assert!(storage.epoch_range(CF_USAGE_HISTORY, 4, 2).unwrap().is_empty());
    }

    #[test]
    fn test_keys_up_to_epoch() {
        let (storage, _temp) = create_test_storage();
        for epoch in 0..5 {
            let key = epoch_key(epoch, &["a", "s"]).unwrap();
            storage.put(CF_RETURNED_TOPICS, &key, b"t").unwrap();
        }

        assert_eq!(storage.keys_up_to_epoch(CF_RETURNED_TOPICS, 1).unwrap().len(), 2);
        assert!(storage.keys_up_to_epoch(CF_RETURNED_TOPICS, -1).unwrap().is_empty());
    }

    #[test]
    fn test_write_batch_is_applied_across_cfs() {
        let (storage, _temp) = create_test_storage();
        storage.put(CF_USAGE_HISTORY, b"old", b"1").unwrap();

        let mut batch = StorageBatch::new();
        batch.put(CF_TOP_TOPICS, b"a".to_vec(), b"1".to_vec());
        batch.put(CF_RETURNED_TOPICS, b"b".to_vec(), b"2".to_vec());
        batch.delete(CF_USAGE_HISTORY, b"old".to_vec());

        assert_eq!(storage.write_batch(batch).unwrap(), 3);
        assert!(storage.get(CF_TOP_TOPICS, b"a").unwrap().is_some());
        assert!(storage.get(CF_RETURNED_TOPICS, b"b").unwrap().is_some());
        assert!(storage.get(CF_USAGE_HISTORY, b"old").unwrap().is_none());
    }

    #[test]
    fn test_write_batch_with_unknown_cf_writes_nothing() {
        let (storage, _temp) = create_test_storage();

        let mut batch = StorageBatch::new();
        batch.put(CF_TOP_TOPICS, b"a".to_vec(), b"1".to_vec());
        batch.put("missing", b"b".to_vec(), b"2".to_vec());

        assert!(storage.write_batch(batch).is_err());
        assert!(storage.get(CF_TOP_TOPICS, b"a").unwrap().is_none());
    }

    #[test]
    fn test_prefix_iterator() {
        let (storage, _temp) = create_test_storage();
        storage.put(CF_TOP_TOPICS, b"p:1", b"1").unwrap();
        storage.put(CF_TOP_TOPICS, b"p:2", b"2").unwrap();
        storage.put(CF_TOP_TOPICS, b"q:1", b"3").unwrap();

        assert_eq!(storage.prefix_iterator(CF_TOP_TOPICS, b"p:").unwrap().len(), 2);
        assert_eq!(storage.scan(CF_TOP_TOPICS).unwrap().len(), 3);
    }

    #[test]
    fn test_stats_and_admin() {
        let (storage, _temp) = create_test_storage();
        storage.put(CF_TOP_TOPICS, b"a", b"1").unwrap();
        storage.flush().unwrap();
        storage.compact().unwrap();
        storage.compact_cf(CF_TOP_TOPICS).unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.rows(CF_TOP_TOPICS), 1);
        assert_eq!(stats.rows(CF_USAGE_HISTORY), 0);
        assert_eq!(stats.row_counts.len(), ALL_CF_NAMES.len());
    }
}
