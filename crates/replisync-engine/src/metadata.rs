//! Per-item sync metadata kept in the key/value extension area.
//!
//! Rows live under `sm/<global id>`, so a prefix scan returns them ordered
//! by global id and the first four id bytes partition them by type. A
//! secondary index `sk/<type tag><local key>` maps live entities back to
//! their global id. Tombstoned rows keep their `sm/` row forever but lose
//! their index entry.

use serde::{Deserialize, Serialize};

use replisync_store::{BatchOp, EntityKey, SyncStore};

use crate::error::SyncError;
use crate::id::{GlobalId, ReplicaIdentity};
use crate::knowledge::Version;

const METADATA_PREFIX: &[u8] = b"sm/";
const KEY_INDEX_PREFIX: &[u8] = b"sk/";

/// Synchronization state of one item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Global identity of the item.
    pub global_id: GlobalId,
    /// True once the item was deleted.
    pub is_tombstone: bool,
    /// Version that created the item.
    pub creation_version: Version,
    /// Version of the latest update.
    pub change_version: Version,
    /// Version of the delete, set only on tombstones.
    pub tombstone_version: Option<Version>,
    /// Local key of the entity; `None` once tombstoned.
    pub target_key: Option<EntityKey>,
}

impl SyncMetadata {
    /// Metadata of a live item.
    pub fn live(global_id: GlobalId, key: EntityKey, creation: Version, change: Version) -> Self {
        Self {
            global_id,
            is_tombstone: false,
            creation_version: creation,
            change_version: change,
            tombstone_version: None,
            target_key: Some(key),
        }
    }

    /// Version that decides whether a peer already has this state.
    pub fn relevant_version(&self) -> Version {
        match (self.is_tombstone, self.tombstone_version) {
            (true, Some(version)) => version,
            _ => self.change_version,
        }
    }

    /// Type tag embedded in the global id.
    pub fn type_tag(&self) -> u32 {
        self.global_id.type_tag()
    }
}

fn row_key(id: &GlobalId) -> Vec<u8> {
    let mut key = METADATA_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_key(type_tag: u32, key: &EntityKey) -> Result<Vec<u8>, SyncError> {
    let mut k = KEY_INDEX_PREFIX.to_vec();
    k.extend_from_slice(&type_tag.to_be_bytes());
    k.extend_from_slice(&key.to_bytes()?);
    Ok(k)
}

/// Metadata access scoped to one store or transaction.
pub struct MetadataStore<'a> {
    store: &'a dyn SyncStore,
    lookup_batch_size: usize,
}

impl<'a> MetadataStore<'a> {
    /// Wraps a store. Keyed lookups are issued `lookup_batch_size` keys at a time.
    pub fn new(store: &'a dyn SyncStore, lookup_batch_size: usize) -> Self {
        Self {
            store,
            lookup_batch_size: lookup_batch_size.max(1),
        }
    }

    /// Up to `limit` rows of one type with id >= `start`, in id order.
    pub fn ordered_metadata(
        &self,
        type_tag: u32,
        start: GlobalId,
        limit: usize,
    ) -> Result<Vec<SyncMetadata>, SyncError> {
        let start = start.max(GlobalId::lower_bound(type_tag));
        let mut end = row_key(&GlobalId::upper_bound(type_tag));
        end.push(0);
        let rows = self.store.scan_range_limit(&row_key(&start), &end, limit)?;
        rows.into_iter()
            .map(|(_, value)| bincode::deserialize::<SyncMetadata>(&value).map_err(SyncError::from))
            .collect()
    }

    /// Number of rows of one type, tombstones included.
    pub fn count(&self, type_tag: u32) -> Result<usize, SyncError> {
        let mut prefix = METADATA_PREFIX.to_vec();
        prefix.extend_from_slice(&type_tag.to_be_bytes());
        Ok(self.store.scan_prefix(&prefix)?.len())
    }

    /// Row for a global id.
    pub fn metadata_by_id(&self, id: &GlobalId) -> Result<Option<SyncMetadata>, SyncError> {
        match self.store.get(&row_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Row of the live entity with this local key.
    pub fn metadata_by_key(
        &self,
        type_tag: u32,
        key: &EntityKey,
    ) -> Result<Option<SyncMetadata>, SyncError> {
        match self.store.get(&index_key(type_tag, key)?)? {
            Some(raw) => self.metadata_by_id(&GlobalId::from_slice(&raw)?),
            None => Ok(None),
        }
    }

    /// Rows of every live entity in `keys` that has one. Order is unspecified.
    pub fn metadata_by_keys(
        &self,
        type_tag: u32,
        keys: &[EntityKey],
    ) -> Result<Vec<SyncMetadata>, SyncError> {
        let mut result = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.lookup_batch_size) {
            for key in chunk {
                if let Some(meta) = self.metadata_by_key(type_tag, key)? {
                    result.push(meta);
                }
            }
        }
        Ok(result)
    }

    /// Creates metadata for a locally created entity: a fresh global id and
    /// creation = change = `tick`.
    pub fn create_metadata(
        &self,
        type_tag: u32,
        local_key: EntityKey,
        replica: &ReplicaIdentity,
        tick: u64,
    ) -> Result<SyncMetadata, SyncError> {
        let id = GlobalId::for_replica(type_tag, replica, tick);
        let version = Version::local(tick);
        self.create_metadata_with_id(id, Some(local_key), version, version)
    }

    /// Creates metadata carrying versions from another replica.
    ///
    /// Without a key the row is written as a tombstone at `change`.
    pub fn create_metadata_with_id(
        &self,
        id: GlobalId,
        local_key: Option<EntityKey>,
        creation: Version,
        change: Version,
    ) -> Result<SyncMetadata, SyncError> {
        let meta = match local_key {
            Some(key) => SyncMetadata::live(id, key, creation, change),
            None => SyncMetadata {
                global_id: id,
                is_tombstone: true,
                creation_version: creation,
                change_version: change,
                tombstone_version: Some(change),
                target_key: None,
            },
        };
        self.update(&meta)?;
        Ok(meta)
    }

    /// Writes a row and its index entry.
    pub fn update(&self, meta: &SyncMetadata) -> Result<(), SyncError> {
        let mut ops = vec![BatchOp::Put {
            key: row_key(&meta.global_id),
            value: bincode::serialize(meta)?,
        }];
        if let (false, Some(key)) = (meta.is_tombstone, &meta.target_key) {
            ops.push(BatchOp::Put {
                key: index_key(meta.type_tag(), key)?,
                value: meta.global_id.as_bytes().to_vec(),
            });
        }
        self.store.write_batch(ops)?;
        Ok(())
    }

    /// Converts a row into a tombstone at `version` and drops its index entry.
    pub fn tombstone(&self, meta: &mut SyncMetadata, version: Version) -> Result<(), SyncError> {
        let mut ops = Vec::with_capacity(2);
        if let Some(key) = meta.target_key.take() {
            ops.push(BatchOp::Delete {
                key: index_key(meta.type_tag(), &key)?,
            });
        }
        meta.is_tombstone = true;
        meta.tombstone_version = Some(version);
        ops.push(BatchOp::Put {
            key: row_key(&meta.global_id),
            value: bincode::serialize(meta)?,
        });
        self.store.write_batch(ops)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replisync_store::{EntitySchema, MemoryStore, Schema};

    fn store() -> MemoryStore {
        MemoryStore::new(
            Schema::new(vec![
                EntitySchema::generated("Author", 1),
                EntitySchema::generated("Book", 2),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_create_and_lookup() {
        let store = store();
        let metadata = MetadataStore::new(&store, 2);
        let replica = ReplicaIdentity::generate();
        let meta = metadata
            .create_metadata(1, EntityKey::generated(7), &replica, 3)
            .unwrap();
        assert_eq!(meta.global_id, GlobalId::for_replica(1, &replica, 3));
        assert_eq!(meta.creation_version, Version::local(3));
        assert_eq!(meta.relevant_version(), Version::local(3));

        assert_eq!(metadata.metadata_by_id(&meta.global_id).unwrap(), Some(meta.clone()));
        assert_eq!(
            metadata.metadata_by_key(1, &EntityKey::generated(7)).unwrap(),
            Some(meta)
        );
        assert!(metadata.metadata_by_key(2, &EntityKey::generated(7)).unwrap().is_none());
    }

    #[test]
    fn test_ordered_scan_is_per_type_and_restartable() {
        let store = store();
        let metadata = MetadataStore::new(&store, 2);
        let replica = ReplicaIdentity::generate();
        for tick in 1..=5 {
            metadata
                .create_metadata(1, EntityKey::generated(tick as i64), &replica, tick)
                .unwrap();
        }
        metadata
            .create_metadata(2, EntityKey::generated(1), &replica, 6)
            .unwrap();

        let first = metadata.ordered_metadata(1, GlobalId::lower_bound(1), 3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].global_id < w[1].global_id));

        let resume = first[2].global_id.next_id().unwrap();
        let rest = metadata.ordered_metadata(1, resume, 10).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|m| m.type_tag() == 1));
        assert_eq!(metadata.count(1).unwrap(), 5);
    }

    #[test]
    fn test_keyed_batch_lookup() {
        let store = store();
        let metadata = MetadataStore::new(&store, 2);
        let replica = ReplicaIdentity::generate();
        for tick in 1..=5u64 {
            metadata
                .create_metadata(1, EntityKey::generated(tick as i64), &replica, tick)
                .unwrap();
        }
        let keys: Vec<_> = (1..=6).map(EntityKey::generated).collect();
        assert_eq!(metadata.metadata_by_keys(1, &keys).unwrap().len(), 5);
    }

    #[test]
    fn test_tombstone_keeps_row_and_drops_index() {
        let store = store();
        let metadata = MetadataStore::new(&store, 2);
        let replica = ReplicaIdentity::generate();
        let mut meta = metadata
            .create_metadata(1, EntityKey::generated(1), &replica, 1)
            .unwrap();
        metadata.tombstone(&mut meta, Version::local(4)).unwrap();

        assert!(metadata.metadata_by_key(1, &EntityKey::generated(1)).unwrap().is_none());
        let row = metadata.metadata_by_id(&meta.global_id).unwrap().unwrap();
        assert!(row.is_tombstone);
        assert!(row.target_key.is_none());
        assert_eq!(row.relevant_version(), Version::local(4));
        assert_eq!(row.change_version, Version::local(1));
    }

    #[test]
    fn test_keyless_create_is_tombstone() {
        let store = store();
        let metadata = MetadataStore::new(&store, 2);
        let id = GlobalId::new(1, 9, 9);
        let meta = metadata
            .create_metadata_with_id(id, None, Version::new(1, 2), Version::new(1, 5))
            .unwrap();
        assert!(meta.is_tombstone);
        assert_eq!(meta.relevant_version(), Version::new(1, 5));
    }
}
