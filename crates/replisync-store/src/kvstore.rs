//! Embedded key-value store backing entities, sync metadata and the
//! extension area.
//!
//! The in-memory implementation keeps everything in a BTreeMap and can be
//! snapshotted to disk with bincode, which is enough to exercise restart
//! behaviour (replica identity, tick sequences) in tests and the demo.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::StoreError;

/// Entry key.
pub type Key = Vec<u8>;
/// Entry value.
pub type Value = Vec<u8>;
/// Key and value returned by scans.
pub type KvPair = (Key, Value);

/// Ordered byte-keyed storage with named counters.
///
/// Entities, sync metadata, the change log and extension blobs all live in
/// one keyspace separated by prefixes. Named monotonic sequences back key
/// generation and logical ticks.
pub trait KvStore: Send + Sync {
    /// Value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError>;

    /// Stores `value`, replacing any previous one.
    fn put(&self, key: Key, value: Value) -> Result<(), StoreError>;

    /// Removes `key`; absent keys are not an error.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError>;

    /// Entries with `start <= key < end`, in key order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, StoreError>;

    /// The first `limit` entries of [`KvStore::scan_range`], without
    /// visiting the rest of the range.
    fn scan_range_limit(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError>;

    /// The first `limit` entries whose key starts with `prefix`.
    fn scan_prefix_limit(&self, prefix: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        match prefix_end(prefix) {
            Some(end) => self.scan_range_limit(prefix, &end, limit),
            None => Ok(self.scan_prefix(prefix)?.into_iter().take(limit).collect()),
        }
    }

    /// True if `key` has a value.
    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Applies all operations at once, in order.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Atomically advances the named sequence and returns the new value.
    ///
    /// The first value issued is 1. Sequences are not transactional: a value
    /// handed out inside a transaction that later rolls back is never reused.
    fn next_sequence(&self, name: &[u8]) -> Result<u64, StoreError>;

    /// Returns the last value issued by the named sequence, 0 if none.
    fn current_sequence(&self, name: &[u8]) -> Result<u64, StoreError>;
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (empty or all-0xff prefix).
fn prefix_end(prefix: &[u8]) -> Option<Key> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// One write inside [`KvStore::write_batch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace.
    Put {
        /// Entry key.
        key: Key,
        /// New value.
        value: Value,
    },
    /// Remove.
    Delete {
        /// Entry key.
        key: Key,
    },
}

#[derive(Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<Key, Value>,
    sequences: BTreeMap<Key, u64>,
}

/// In-memory KV store: one ordered map of entries plus the named sequences,
/// both behind a single lock so snapshots are consistent.
#[derive(Default)]
pub struct MemoryKvStore {
    state: RwLock<KvState>,
}

fn poisoned<T>(e: PoisonError<T>) -> StoreError {
    StoreError::KvError(format!("kv store lock poisoned: {}", e))
}

impl MemoryKvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KvState>, StoreError> {
        self.state.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KvState>, StoreError> {
        self.state.write().map_err(poisoned)
    }

    /// Writes the full store contents, sequences included, to `path`.
    ///
    /// The file is written next to `path` and renamed into place.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = bincode::serialize(&*self.read()?)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "kv snapshot written");
        Ok(())
    }

    /// Restores a store written by [`MemoryKvStore::save_snapshot`].
    pub fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        let state: KvState = bincode::deserialize(&std::fs::read(path)?)?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Number of entries, sequences excluded.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.data.len())
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.read()?.data.is_empty())
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.read()?.data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.write()?.data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write()?.data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let state = self.read()?;
        Ok(state
            .data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        self.scan_range_limit(start, end, usize::MAX)
    }

    fn scan_range_limit(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        Ok(state
            .data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read()?.data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    state.data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    state.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn next_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let value = state.sequences.entry(name.to_vec()).or_insert(0);
        *value = value
            .checked_add(1)
            .ok_or_else(|| StoreError::KvError("sequence exhausted".to_string()))?;
        Ok(*value)
    }

    fn current_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        Ok(self.read()?.sequences.get(name).copied().unwrap_or(0))
    }
}
