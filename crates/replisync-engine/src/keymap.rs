//! Session-scoped remapping of remote identities to local keys.
//!
//! Incoming references name their target by global id (and by the source's
//! local key). When the target is not materialized yet, the referencing
//! field is left null and a [`KeyDependency`] is queued; registering the
//! target later back-fills every queued field.

use std::collections::HashMap;

use replisync_store::{EntityKey, FieldValue, SyncStore, TypeName};
use tracing::debug;

use crate::change::Identity;
use crate::error::SyncError;
use crate::id::GlobalId;
use crate::metadata::MetadataStore;

/// A reference field waiting for its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDependency {
    /// Type of the entity holding the field.
    pub pending_type: TypeName,
    /// Local key of the entity holding the field.
    pub pending_key: EntityKey,
    /// Field to fill.
    pub field: String,
    /// Identity of the missing target.
    pub identity: Identity,
}

/// Remote -> local key mappings for one destination session.
#[derive(Debug, Default)]
pub struct KeyMap {
    by_global_id: HashMap<GlobalId, EntityKey>,
    by_source_key: HashMap<(TypeName, EntityKey), EntityKey>,
    pending: HashMap<GlobalId, Vec<KeyDependency>>,
    orphaned: Vec<KeyDependency>,
}

impl KeyMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `id` (known on the source as `source_key`) is `local_key`
    /// here and fills every field waiting on it. Returns the number filled.
    pub fn register(
        &mut self,
        store: &dyn SyncStore,
        id: GlobalId,
        type_name: &TypeName,
        source_key: Option<&EntityKey>,
        local_key: EntityKey,
    ) -> Result<usize, SyncError> {
        if let Some(source_key) = source_key {
            self.by_source_key
                .insert((type_name.clone(), source_key.clone()), local_key.clone());
        }
        self.by_global_id.insert(id, local_key.clone());

        let waiting = self.pending.remove(&id).unwrap_or_default();
        let mut filled = 0;
        for dep in waiting {
            if let Some(mut entity) = store.get_by_key(&dep.pending_type, &dep.pending_key)? {
                entity.set(&dep.field, FieldValue::Ref(local_key.clone()));
                store.put_entity(&entity)?;
                filled += 1;
            }
        }
        if filled > 0 {
            debug!(global_id = %id, filled, "back-filled deferred references");
        }
        Ok(filled)
    }

    /// Drops the mapping of a deleted item.
    pub fn forget(&mut self, id: &GlobalId) {
        self.by_global_id.remove(id);
    }

    /// Local key for `identity`, looking at session mappings first and then
    /// at live metadata.
    pub fn resolve(
        &mut self,
        metadata: &MetadataStore<'_>,
        target_type: &TypeName,
        identity: &Identity,
    ) -> Result<Option<EntityKey>, SyncError> {
        if let Some(id) = identity.global_id {
            if let Some(key) = self.by_global_id.get(&id) {
                return Ok(Some(key.clone()));
            }
            if let Some(meta) = metadata.metadata_by_id(&id)? {
                if let (false, Some(key)) = (meta.is_tombstone, meta.target_key) {
                    self.by_global_id.insert(id, key.clone());
                    return Ok(Some(key));
                }
            }
            return Ok(None);
        }
        Ok(identity.local_key.as_ref().and_then(|source_key| {
            self.by_source_key
                .get(&(target_type.clone(), source_key.clone()))
                .cloned()
        }))
    }

    /// Queues a field to fill once its target is registered.
    pub fn register_dependency(&mut self, dependency: KeyDependency) {
        match dependency.identity.global_id {
            Some(id) => self.pending.entry(id).or_default().push(dependency),
            None => self.orphaned.push(dependency),
        }
    }

    /// Drops queued fills for one field, e.g. because a newer value arrived.
    pub fn clear_dependencies(&mut self, pending_type: &TypeName, pending_key: &EntityKey, field: &str) {
        let matches = |d: &KeyDependency| {
            &d.pending_type == pending_type && &d.pending_key == pending_key && d.field == field
        };
        self.pending.retain(|_, deps| {
            deps.retain(|d| !matches(d));
            !deps.is_empty()
        });
        self.orphaned.retain(|d| !matches(d));
    }

    /// Number of queued fills.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum::<usize>() + self.orphaned.len()
    }

    /// Removes and returns every queued fill.
    pub fn drain_unresolved(&mut self) -> Vec<KeyDependency> {
        let mut all: Vec<KeyDependency> = self.pending.drain().flat_map(|(_, deps)| deps).collect();
        all.append(&mut self.orphaned);
        all
    }
}
