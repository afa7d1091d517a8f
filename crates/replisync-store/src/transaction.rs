//! Buffered transactions over the in-memory KV store.
//!
//! A transaction records puts and deletes in a private overlay; reads see the
//! overlay first and fall back to the base store. Commit applies the overlay
//! with a single atomic `write_batch`, rollback simply drops it. Sequences
//! bypass the overlay so reserved values are never handed out twice.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::entity::{EntityStore, KvBacked, MemoryStore};
use crate::error::StoreError;
use crate::kvstore::{BatchOp, KvPair, KvStore, MemoryKvStore, Value};
use crate::schema::Schema;

/// Everything the sync engine needs from a store: entities plus raw KV access.
pub trait SyncStore: EntityStore + KvStore {}

impl<T: EntityStore + KvStore + ?Sized> SyncStore for T {}

/// An open storage transaction.
pub trait StoreTransaction: SyncStore {
    /// Views the transaction as a plain [`SyncStore`].
    fn as_store(&self) -> &dyn SyncStore;

    /// Makes every buffered write visible atomically.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards every buffered write.
    fn rollback(self: Box<Self>);
}

/// Opens transactions.
pub trait SessionHost: Send + Sync {
    /// Begins a new transaction.
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Transaction over a [`MemoryKvStore`].
pub struct MemoryTransaction {
    base: Arc<MemoryKvStore>,
    schema: Arc<Schema>,
    writes: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl MemoryTransaction {
    /// Starts a transaction over `base`.
    pub fn new(base: Arc<MemoryKvStore>, schema: Arc<Schema>) -> Self {
        Self {
            base,
            schema,
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> Result<usize, StoreError> {
        let writes = self
            .writes
            .lock()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        Ok(writes.len())
    }

    fn overlay(
        &self,
        base: Vec<KvPair>,
        in_range: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<KvPair>, StoreError> {
        let writes = self
            .writes
            .lock()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        for (k, v) in writes.iter().filter(|(k, _)| in_range(k)) {
            match v {
                Some(value) => {
                    merged.insert(k.clone(), value.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl KvStore for MemoryTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        {
            let writes = self
                .writes
                .lock()
                .map_err(|e| StoreError::KvError(e.to_string()))?;
            if let Some(buffered) = writes.get(key) {
                return Ok(buffered.clone());
            }
        }
        self.base.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        writes.insert(key, Some(value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let base = self.base.scan_prefix(prefix)?;
        self.overlay(base, |k| k.starts_with(prefix))
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let base = self.base.scan_range(start, end)?;
        self.overlay(base, |k| k >= start && k < end)
    }

    fn scan_range_limit(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }
        let buffered: Vec<(Vec<u8>, Option<Vec<u8>>)> = {
            let writes = self
                .writes
                .lock()
                .map_err(|e| StoreError::KvError(e.to_string()))?;
            writes
                .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        // Each buffered delete can hide at most one base entry.
        let deletes = buffered.iter().filter(|(_, v)| v.is_none()).count();
        let base = self
            .base
            .scan_range_limit(start, end, limit.saturating_add(deletes))?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        for (k, v) in buffered {
            match v {
                Some(value) => {
                    merged.insert(k, value);
                }
                None => {
                    merged.remove(&k);
                }
            }
        }
        Ok(merged.into_iter().take(limit).collect())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    writes.insert(key, Some(value));
                }
                BatchOp::Delete { key } => {
                    writes.insert(key, None);
                }
            }
        }
        Ok(())
    }

    fn next_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        self.base.next_sequence(name)
    }

    fn current_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        self.base.current_sequence(name)
    }
}

impl KvBacked for MemoryTransaction {
    fn kv(&self) -> &dyn KvStore {
        self
    }

    fn schema_ref(&self) -> &Schema {
        &self.schema
    }
}

impl StoreTransaction for MemoryTransaction {
    fn as_store(&self) -> &dyn SyncStore {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let writes = this
            .writes
            .into_inner()
            .map_err(|e| StoreError::KvError(e.to_string()))?;
        let count = writes.len();
        let ops = writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect();
        this.base.write_batch(ops)?;
        debug!(writes = count, "transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        let discarded = self.writes.lock().map(|w| w.len()).unwrap_or(0);
        debug!(writes = discarded, "transaction rolled back");
    }
}

impl SessionHost for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction::new(
            self.kv_store().clone(),
            self.schema_arc().clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDef};
    use crate::types::{Entity, FieldValue, TypeName};

    fn store() -> MemoryStore {
        MemoryStore::new(
            Schema::new(vec![
                EntitySchema::generated("Author", 1).with_field(FieldDef::scalar("name"))
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_reads_see_own_writes() {
        let store = store();
        let txn = store.begin().unwrap();
        txn.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.kv_store().get(b"a").unwrap(), None);
    }

    #[test]
    fn test_commit_applies_writes() {
        let store = store();
        store.kv_store().put(b"old".to_vec(), b"x".to_vec()).unwrap();
        let txn = store.begin().unwrap();
        txn.put(b"new".to_vec(), b"y".to_vec()).unwrap();
        txn.delete(b"old").unwrap();
        assert!(!txn.contains_key(b"old").unwrap());
        txn.commit().unwrap();

        assert_eq!(store.kv_store().get(b"new").unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.kv_store().get(b"old").unwrap(), None);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = store();
        let txn = store.begin().unwrap();
        let author = TypeName::from("Author");
        let key = txn.create_entity(&author, None).unwrap();
        txn.put_entity(
            &Entity::new(author.clone(), key.clone()).with_field("name", FieldValue::Text("x".into())),
        )
        .unwrap();
        txn.rollback();

        assert!(store.get_by_key(&author, &key).unwrap().is_none());
        // The key sequence is not rolled back.
        let txn = store.begin().unwrap();
        assert_ne!(txn.create_entity(&author, None).unwrap(), key);
    }

    #[test]
    fn test_scan_overlays_buffer() {
        let store = store();
        store.kv_store().put(b"p/1".to_vec(), b"a".to_vec()).unwrap();
        store.kv_store().put(b"p/2".to_vec(), b"b".to_vec()).unwrap();
        let txn = store.begin().unwrap();
        txn.delete(b"p/1").unwrap();
        txn.put(b"p/3".to_vec(), b"c".to_vec()).unwrap();
        txn.put(b"q/1".to_vec(), b"d".to_vec()).unwrap();

        let keys: Vec<_> = txn.scan_prefix(b"p/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"p/2".to_vec(), b"p/3".to_vec()]);

        let ranged = txn.scan_range(b"p/2", b"q/").unwrap();
        assert_eq!(ranged.len(), 2);
    }

    #[test]
    fn test_limited_scan_skips_buffered_deletes() {
        let store = store();
        for k in ["p/1", "p/2", "p/3", "p/4"] {
            store.kv_store().put(k.as_bytes().to_vec(), b"x".to_vec()).unwrap();
        }
        let txn = store.begin().unwrap();
        txn.delete(b"p/1").unwrap();
        txn.delete(b"p/2").unwrap();
        txn.put(b"p/0".to_vec(), b"y".to_vec()).unwrap();

        let keys: Vec<_> = txn
            .scan_prefix_limit(b"p/", 2)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"p/0".to_vec(), b"p/3".to_vec()]);
        let all = txn.scan_range_limit(b"p/", b"q/", 10).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_as_store_exposes_entities() {
        let store = store();
        let txn = store.begin().unwrap();
        let sync_store = txn.as_store();
        let key = sync_store.create_entity(&TypeName::from("Author"), None).unwrap();
        assert!(sync_store.get_by_key(&TypeName::from("Author"), &key).unwrap().is_some());
    }
}
