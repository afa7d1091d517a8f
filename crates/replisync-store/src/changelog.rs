//! Durable change log fed by the transactional change recorder.
//!
//! Each committed local transaction appends one notification per touched
//! entity. The sync engine drains the log in bounded batches and turns the
//! notifications into sync metadata. Entries are keyed by a big-endian
//! sequence number so a prefix scan returns them in append order.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{EntityKey, TypeName};

const CHANGE_LOG_PREFIX: &[u8] = b"clog/";
const CHANGE_LOG_SEQUENCE: &[u8] = b"clog";

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Entity inserted.
    Created,
    /// Entity fields changed.
    Modified,
    /// Entity deleted.
    Removed,
}

/// One recorded change to a local entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Entity type.
    pub type_name: TypeName,
    /// Local key of the entity.
    pub key: EntityKey,
    /// Kind of change.
    pub kind: NotificationKind,
}

impl ChangeNotification {
    /// Notification for an inserted entity.
    pub fn created(type_name: TypeName, key: EntityKey) -> Self {
        Self {
            type_name,
            key,
            kind: NotificationKind::Created,
        }
    }

    /// Notification for a modified entity.
    pub fn modified(type_name: TypeName, key: EntityKey) -> Self {
        Self {
            type_name,
            key,
            kind: NotificationKind::Modified,
        }
    }

    /// Notification for a removed entity.
    pub fn removed(type_name: TypeName, key: EntityKey) -> Self {
        Self {
            type_name,
            key,
            kind: NotificationKind::Removed,
        }
    }
}

fn log_key(seq: u64) -> Vec<u8> {
    let mut key = CHANGE_LOG_PREFIX.to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_seq(key: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = key
        .get(CHANGE_LOG_PREFIX.len()..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::KvError("malformed change log key".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Accessor for the change log stored in a KV store.
pub struct ChangeLog;

impl ChangeLog {
    /// Appends notifications and returns the sequence of the last one.
    pub fn append<K: KvStore + ?Sized>(
        kv: &K,
        notifications: &[ChangeNotification],
    ) -> Result<Option<u64>, StoreError> {
        let mut ops = Vec::with_capacity(notifications.len());
        let mut last = None;
        for n in notifications {
            let seq = kv.next_sequence(CHANGE_LOG_SEQUENCE)?;
            ops.push(BatchOp::Put {
                key: log_key(seq),
                value: bincode::serialize(n)?,
            });
            last = Some(seq);
        }
        kv.write_batch(ops)?;
        Ok(last)
    }

    /// Returns up to `limit` pending notifications, oldest first.
    pub fn pending<K: KvStore + ?Sized>(
        kv: &K,
        limit: usize,
    ) -> Result<Vec<(u64, ChangeNotification)>, StoreError> {
        let mut result = Vec::new();
        for (key, value) in kv.scan_prefix_limit(CHANGE_LOG_PREFIX, limit)? {
            result.push((parse_seq(&key)?, bincode::deserialize(&value)?));
        }
        Ok(result)
    }

    /// Removes every entry with a sequence `<= through`. Returns how many were removed.
    pub fn acknowledge<K: KvStore + ?Sized>(kv: &K, through: u64) -> Result<usize, StoreError> {
        let end = match through.checked_add(1) {
            Some(next) => log_key(next),
            None => {
                let mut end = CHANGE_LOG_PREFIX.to_vec();
                end.extend_from_slice(&[0xFF; 9]);
                end
            }
        };
        let doomed = kv.scan_range(&log_key(0), &end)?;
        let count = doomed.len();
        kv.write_batch(
            doomed
                .into_iter()
                .map(|(key, _)| BatchOp::Delete { key })
                .collect(),
        )?;
        Ok(count)
    }

    /// Number of pending entries.
    pub fn len<K: KvStore + ?Sized>(kv: &K) -> Result<usize, StoreError> {
        Ok(kv.scan_prefix(CHANGE_LOG_PREFIX)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;

    fn note(i: i64) -> ChangeNotification {
        ChangeNotification::created(TypeName::from("Author"), EntityKey::generated(i))
    }

    #[test]
    fn test_append_and_read_in_order() {
        let kv = MemoryKvStore::new();
        assert_eq!(ChangeLog::append(&kv, &[note(1), note(2)]).unwrap(), Some(2));
        assert_eq!(ChangeLog::append(&kv, &[note(3)]).unwrap(), Some(3));

        let pending = ChangeLog::pending(&kv, 10).unwrap();
        let seqs: Vec<u64> = pending.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(pending[2].1, note(3));
    }

    #[test]
    fn test_pending_respects_limit() {
        let kv = MemoryKvStore::new();
        ChangeLog::append(&kv, &[note(1), note(2), note(3)]).unwrap();
        assert_eq!(ChangeLog::pending(&kv, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_acknowledge_removes_prefix() {
        let kv = MemoryKvStore::new();
        ChangeLog::append(&kv, &[note(1), note(2), note(3)]).unwrap();
        assert_eq!(ChangeLog::acknowledge(&kv, 2).unwrap(), 2);
        assert_eq!(ChangeLog::len(&kv).unwrap(), 1);
        assert_eq!(ChangeLog::pending(&kv, 10).unwrap()[0].0, 3);
    }

    #[test]
    fn test_pending_in_transaction_skips_acknowledged() {
        use crate::schema::Schema;
        use crate::transaction::SessionHost;

        let store = crate::entity::MemoryStore::new(Schema::new(Vec::new()).unwrap());
        ChangeLog::append(&store, &[note(1), note(2), note(3), note(4)]).unwrap();
        let txn = store.begin().unwrap();
        assert_eq!(ChangeLog::acknowledge(txn.as_store(), 2).unwrap(), 2);

        let seqs: Vec<u64> = ChangeLog::pending(txn.as_store(), 1)
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(seqs, vec![3]);
        // Still buffered.
        assert_eq!(ChangeLog::len(&store).unwrap(), 4);
    }

    #[test]
    fn test_empty_append() {
        let kv = MemoryKvStore::new();
        assert_eq!(ChangeLog::append(&kv, &[]).unwrap(), None);
        assert_eq!(ChangeLog::len(&kv).unwrap(), 0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_acknowledge_leaves_ordered_suffix(chunks in prop::collection::vec(1usize..80, 1..10), through in 0u64..700) {
                let kv = MemoryKvStore::new();
                let mut total = 0u64;
                for chunk in chunks {
                    let notes: Vec<_> = (0..chunk).map(|i| note(i as i64)).collect();
                    ChangeLog::append(&kv, &notes).unwrap();
                    total += chunk as u64;
                }
                let removed = ChangeLog::acknowledge(&kv, through).unwrap() as u64;
                prop_assert_eq!(removed, through.min(total));

                let seqs: Vec<u64> = ChangeLog::pending(&kv, usize::MAX)
                    .unwrap()
                    .into_iter()
                    .map(|(s, _)| s)
                    .collect();
                let expected: Vec<u64> = (through.min(total) + 1..=total).collect();
                prop_assert_eq!(seqs, expected);
            }
        }
    }
}
