//! Key-value storage backends
//!
//! RocksDB for durable deployments, an ordered in-memory map for tests and
//! local runs. Mutations are staged in a [`Txn`] and land as one atomic batch,
//! so an operation is either fully persisted or not at all.

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::{EngineResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Single mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered key-value store with atomic batch writes
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply every op or none of them
    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Entries under `prefix` in ascending key order, strictly after `start_after` when given
    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// RocksDB-backed store
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn open_with_config(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.clear_on_start {
            tracing::warn!(path = %config.data_directory, "Clearing database on start");
            DB::destroy(&Options::default(), &config.data_directory)
                .map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        }
        Self::open(&config.data_directory)
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => batch.put(key, value),
                BatchOp::Delete(key) => batch.delete(key),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = start_after.unwrap_or(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if start_after.is_some_and(|after| key.as_ref() == after) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }
}

/// Ordered in-memory store
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self
            .map
            .read()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self
            .map
            .read()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;

        let lower = match start_after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };

        Ok(map
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Open the backend selected by configuration
pub fn open_store(config: &StorageConfig) -> EngineResult<Arc<dyn KvStore>> {
    match config.backend {
        StorageBackend::Rocksdb => Ok(Arc::new(RocksStore::open_with_config(config)?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Staged writes over a store
///
/// Reads see the transaction's own pending writes first. Nothing reaches the
/// store until [`Txn::commit`], which writes everything as one batch.
pub struct Txn<'a> {
    store: &'a dyn KvStore,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Txn<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.store.get(key)?),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> EngineResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::Corrupted(format!(
                        "Failed to decode {}: {}",
                        String::from_utf8_lossy(key),
                        e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> EngineResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    pub fn put_json<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StorageError::Corrupted(format!("Failed to encode {}: {}", String::from_utf8_lossy(&key), e))
        })?;
        self.put(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Write all staged mutations atomically
    pub fn commit(self) -> EngineResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let ops = self
            .staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put(key, value),
                None => BatchOp::Delete(key),
            })
            .collect();
        self.store.write(ops)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise_scan(store: &dyn KvStore) {
        store
            .write(vec![
                BatchOp::Put(b"a:1".to_vec(), b"1".to_vec()),
                BatchOp::Put(b"a:2".to_vec(), b"2".to_vec()),
                BatchOp::Put(b"a:3".to_vec(), b"3".to_vec()),
                BatchOp::Put(b"b:1".to_vec(), b"x".to_vec()),
            ])
            .unwrap();

        let rows = store.scan_prefix(b"a:", None, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, b"a:1".to_vec());

        let rows = store.scan_prefix(b"a:", Some(b"a:1"), 1).unwrap();
        assert_eq!(rows, vec![(b"a:2".to_vec(), b"2".to_vec())]);

        store.write(vec![BatchOp::Delete(b"a:2".to_vec())]).unwrap();
        assert!(store.get(b"a:2").unwrap().is_none());
        assert_eq!(store.scan_prefix(b"a:", None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_store_scan() {
        exercise_scan(&MemoryStore::new());
    }

    #[test]
    fn test_rocks_store_scan() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        exercise_scan(&store);
    }

    #[test]
    fn test_txn_reads_own_writes_and_commits_atomically() {
        let store = MemoryStore::new();
        store.write(vec![BatchOp::Put(b"k".to_vec(), b"old".to_vec())]).unwrap();

        let mut txn = Txn::new(&store);
        txn.put(b"k".to_vec(), b"new".to_vec());
        txn.delete(b"gone".to_vec());
        assert_eq!(txn.get(b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"k").unwrap(), Some(b"old".to_vec()));

        txn.commit().unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_dropped_txn_leaves_store_untouched() {
        let store = MemoryStore::new();
        {
            let mut txn = Txn::new(&store);
            txn.put(b"k".to_vec(), b"v".to_vec());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupted_record_is_not_retryable() {
        let store = MemoryStore::new();
        store.write(vec![BatchOp::Put(b"k".to_vec(), b"{not json".to_vec())]).unwrap();
        let txn = Txn::new(&store);
        let err = txn.get_json::<u64>(b"k").unwrap_err();
        assert!(!err.is_retryable());
    }
}
