//! Destination-side application of change batches.
//!
//! Incoming versions are translated into the destination's key space before
//! any comparison. An item whose incoming version is already known, or whose
//! local relevant version equals it, is skipped, so replaying a batch is a
//! no-op. A local version the source did not know when it built the batch
//! is a conflict.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use replisync_store::{Entity, EntityKey, EntitySchema, FieldValue, KeyGeneration, SyncStore, TypeName};
use tracing::{debug, info, warn};

use crate::batch::ChangeBatch;
use crate::change::{ChangeDataSource, ChangeDescriptor, ChangeKind, ItemChangeData};
use crate::config::UnresolvedReferencePolicy;
use crate::error::SyncError;
use crate::id::GlobalId;
use crate::keymap::{KeyDependency, KeyMap};
use crate::knowledge::{Knowledge, Version};
use crate::metadata::{MetadataStore, SyncMetadata};
use crate::registry::TypeRegistry;

/// How concurrent updates are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The incoming change overwrites the local one.
    #[default]
    SourceWins,
    /// The local change is kept.
    DestinationWins,
    /// [`SyncCallbacks::on_conflict`] decides per item.
    Callback,
}

/// Outcome of a single conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Apply the incoming change.
    SourceWins,
    /// Keep the local state.
    DestinationWins,
}

/// A concurrent update, as presented to callbacks.
#[derive(Debug, Clone)]
pub struct ItemConflict {
    /// Item identity.
    pub global_id: GlobalId,
    /// Item type.
    pub type_name: TypeName,
    /// Local change version, in the destination's key space.
    pub local_version: Version,
    /// Incoming change version, in the destination's key space.
    pub remote_version: Version,
    /// Current local entity.
    pub local: Option<Entity>,
    /// Incoming payload.
    pub remote: ItemChangeData,
}

/// Hooks invoked while batches are applied. All methods have defaults.
pub trait SyncCallbacks {
    /// Settles one conflict under [`ConflictPolicy::Callback`].
    fn on_conflict(&mut self, _conflict: &ItemConflict) -> ConflictResolution {
        ConflictResolution::SourceWins
    }

    /// Called after each descriptor.
    fn on_item_applied(&mut self, _change: &ChangeDescriptor, _outcome: ApplyOutcome) {}

    /// Called after each batch.
    fn on_batch_applied(&mut self, _sequence: u32, _changes: usize) {}
}

/// Callbacks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl SyncCallbacks for NoopCallbacks {}

/// What happened to one incoming descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// A new local entity was created.
    Created,
    /// An existing entity was overwritten.
    Updated,
    /// A live entity was removed.
    Deleted,
    /// Nothing to do.
    Skipped,
    /// Conflict settled in favour of the local state.
    ConflictKeptLocal,
}

/// Counters for one destination session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    /// Entities created.
    pub created: u64,
    /// Entities overwritten.
    pub updated: u64,
    /// Entities removed.
    pub deleted: u64,
    /// Descriptors with nothing to do.
    pub skipped: u64,
    /// Concurrent updates detected, whatever their resolution.
    pub conflicts: u64,
    /// Reference fields left null while waiting for their target.
    pub deferred_references: u64,
    /// Reference fields still null at session end.
    pub unresolved_references: u64,
}

impl ApplyStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Skipped | ApplyOutcome::ConflictKeptLocal => self.skipped += 1,
        }
    }

    /// Descriptors that changed local state.
    pub fn applied(&self) -> u64 {
        self.created + self.updated + self.deleted
    }

    /// Adds another session's counters.
    pub fn merge(&mut self, other: &ApplyStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.deferred_references += other.deferred_references;
        self.unresolved_references += other.unresolved_references;
    }
}

/// Incoming change with versions already translated.
struct Incoming<'b> {
    schema: &'b EntitySchema,
    descriptor: &'b ChangeDescriptor,
    creation: Version,
    change: Version,
    batch: &'b ChangeBatch,
}

/// Applies batches to one destination transaction.
pub struct ChangeApplier {
    registry: Arc<TypeRegistry>,
    knowledge: Knowledge,
    key_map: KeyMap,
    stats: ApplyStats,
    lookup_batch_size: usize,
}

impl ChangeApplier {
    /// `knowledge` is the destination's knowledge at session start.
    pub fn new(registry: Arc<TypeRegistry>, knowledge: Knowledge, lookup_batch_size: usize) -> Self {
        Self {
            registry,
            knowledge,
            key_map: KeyMap::new(),
            stats: ApplyStats::default(),
            lookup_batch_size,
        }
    }

    /// Working knowledge: session start plus every batch applied so far.
    pub fn knowledge(&self) -> &Knowledge {
        &self.knowledge
    }

    /// Counters so far.
    pub fn stats(&self) -> &ApplyStats {
        &self.stats
    }

    /// Reference fields waiting for their target.
    pub fn pending_references(&self) -> usize {
        self.key_map.pending_count()
    }

    /// Applies every descriptor of `batch`, then merges its learned knowledge.
    pub fn apply_batch(
        &mut self,
        store: &dyn SyncStore,
        policy: ConflictPolicy,
        batch: &ChangeBatch,
        source: &dyn ChangeDataSource,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<(), SyncError> {
        for descriptor in &batch.changes {
            let outcome = self.apply_change(store, policy, batch, descriptor, source, callbacks)?;
            self.stats.record(outcome);
            callbacks.on_item_applied(descriptor, outcome);
        }
        self.knowledge.combine(&batch.learned_knowledge)?;
        callbacks.on_batch_applied(batch.sequence, batch.changes.len());
        debug!(
            source = %batch.source,
            sequence = batch.sequence,
            changes = batch.changes.len(),
            last = batch.is_last_batch,
            "batch applied"
        );
        Ok(())
    }

    /// Settles references still pending and returns the final knowledge.
    pub fn finish(mut self, policy: UnresolvedReferencePolicy) -> Result<(Knowledge, ApplyStats), SyncError> {
        let unresolved = self.key_map.drain_unresolved();
        if !unresolved.is_empty() {
            match policy {
                UnresolvedReferencePolicy::Fail => {
                    return Err(SyncError::UnresolvedReference {
                        count: unresolved.len(),
                    })
                }
                UnresolvedReferencePolicy::LeaveNull => {
                    for dep in &unresolved {
                        warn!(
                            type_name = %dep.pending_type,
                            key = %dep.pending_key,
                            field = %dep.field,
                            "reference left null, target never arrived"
                        );
                    }
                    self.stats.unresolved_references += unresolved.len() as u64;
                }
            }
        }
        Ok((self.knowledge, self.stats))
    }

    fn apply_change(
        &mut self,
        store: &dyn SyncStore,
        policy: ConflictPolicy,
        batch: &ChangeBatch,
        descriptor: &ChangeDescriptor,
        source: &dyn ChangeDataSource,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<ApplyOutcome, SyncError> {
        let id = descriptor.global_id;
        if descriptor.kind == ChangeKind::UnknownItem {
            return Err(SyncError::UnsupportedAction { global_id: id });
        }

        let registry = Arc::clone(&self.registry);
        let schema = registry.by_tag(id.type_tag())?;
        let creation = self
            .knowledge
            .translate(&batch.made_with_knowledge, descriptor.creation_version)?;
        let change = self
            .knowledge
            .translate(&batch.made_with_knowledge, descriptor.change_version)?;
        if self.knowledge.contains_version(&id, &change) {
            return Ok(ApplyOutcome::Skipped);
        }

        let metadata = MetadataStore::new(store, self.lookup_batch_size);
        let local = metadata.metadata_by_id(&id)?;
        if local.as_ref().map_or(false, |m| m.relevant_version() == change) {
            return Ok(ApplyOutcome::Skipped);
        }

        let incoming = Incoming {
            schema,
            descriptor,
            creation,
            change,
            batch,
        };
        match (descriptor.kind, local) {
            (ChangeKind::Delete, local) => self.apply_delete(store, &metadata, &incoming, local),
            (ChangeKind::Update, Some(meta)) => {
                self.apply_update(store, &metadata, &incoming, meta, policy, source, callbacks)
            }
            (ChangeKind::Update, None) => self.apply_create(store, &metadata, &incoming, source),
            (ChangeKind::UnknownItem, _) => Err(SyncError::UnsupportedAction { global_id: id }),
        }
    }

    fn apply_delete(
        &mut self,
        store: &dyn SyncStore,
        metadata: &MetadataStore<'_>,
        incoming: &Incoming<'_>,
        local: Option<SyncMetadata>,
    ) -> Result<ApplyOutcome, SyncError> {
        let id = incoming.descriptor.global_id;
        let mut meta = match local {
            None => {
                metadata.create_metadata_with_id(id, None, incoming.creation, incoming.change)?;
                debug!(global_id = %id, "tombstone recorded for unknown item");
                return Ok(ApplyOutcome::Skipped);
            }
            Some(meta) if meta.is_tombstone => return Ok(ApplyOutcome::Skipped),
            Some(meta) => meta,
        };

        if !self.source_knew(incoming.batch, &meta)? {
            self.stats.conflicts += 1;
            info!(global_id = %id, "local update superseded by concurrent delete");
        }
        let key = meta.target_key.clone();
        metadata.tombstone(&mut meta, incoming.change)?;
        if let Some(key) = key {
            store.remove_entity(&incoming.schema.name, &key)?;
        }
        self.key_map.forget(&id);
        Ok(ApplyOutcome::Deleted)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_update(
        &mut self,
        store: &dyn SyncStore,
        metadata: &MetadataStore<'_>,
        incoming: &Incoming<'_>,
        mut meta: SyncMetadata,
        policy: ConflictPolicy,
        source: &dyn ChangeDataSource,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<ApplyOutcome, SyncError> {
        let id = incoming.descriptor.global_id;
        let schema = incoming.schema;
        let key = match (meta.is_tombstone, meta.target_key.clone()) {
            (false, Some(key)) => key,
            _ => {
                debug!(global_id = %id, "update of deleted item ignored");
                return Ok(ApplyOutcome::Skipped);
            }
        };
        let data = source.load_change_data(incoming.descriptor)?;

        if !self.source_knew(incoming.batch, &meta)? {
            self.stats.conflicts += 1;
            let resolution = match policy {
                ConflictPolicy::SourceWins => ConflictResolution::SourceWins,
                ConflictPolicy::DestinationWins => ConflictResolution::DestinationWins,
                ConflictPolicy::Callback => {
                    let conflict = ItemConflict {
                        global_id: id,
                        type_name: schema.name.clone(),
                        local_version: meta.change_version,
                        remote_version: incoming.change,
                        local: store.get_by_key(&schema.name, &key)?,
                        remote: data.clone(),
                    };
                    callbacks.on_conflict(&conflict)
                }
            };
            info!(global_id = %id, type_name = %schema.name, ?resolution, "concurrent update");
            if resolution == ConflictResolution::DestinationWins {
                self.key_map
                    .register(store, id, &schema.name, data.key.as_ref(), key)?;
                return Ok(ApplyOutcome::ConflictKeptLocal);
            }
        }

        self.write_entity(store, metadata, schema, &key, &data)?;
        meta.change_version = incoming.change;
        metadata.update(&meta)?;
        self.key_map
            .register(store, id, &schema.name, data.key.as_ref(), key)?;
        Ok(ApplyOutcome::Updated)
    }

    fn apply_create(
        &mut self,
        store: &dyn SyncStore,
        metadata: &MetadataStore<'_>,
        incoming: &Incoming<'_>,
        source: &dyn ChangeDataSource,
    ) -> Result<ApplyOutcome, SyncError> {
        let id = incoming.descriptor.global_id;
        let schema = incoming.schema;
        let data = source.load_change_data(incoming.descriptor)?;
        let source_key = data.key.clone().ok_or(SyncError::MissingChangeData(id))?;

        let key = match schema.key_generation {
            KeyGeneration::Generated => store.create_entity(&schema.name, None)?,
            KeyGeneration::Assigned => {
                let key = self.assigned_key(store, metadata, schema, &source_key, &data)?;
                if let Some(mut existing) = metadata.metadata_by_key(schema.type_tag, &key)? {
                    warn!(
                        global_id = %id,
                        existing = %existing.global_id,
                        key = %key,
                        "natural key already taken, merging into existing item"
                    );
                    self.write_entity(store, metadata, schema, &key, &data)?;
                    existing.change_version = incoming.change;
                    metadata.update(&existing)?;
                    self.key_map
                        .register(store, id, &schema.name, Some(&source_key), key)?;
                    return Ok(ApplyOutcome::Updated);
                }
                key
            }
        };

        metadata.create_metadata_with_id(id, Some(key.clone()), incoming.creation, incoming.change)?;
        self.write_entity(store, metadata, schema, &key, &data)?;
        self.key_map
            .register(store, id, &schema.name, Some(&source_key), key)?;
        Ok(ApplyOutcome::Created)
    }

    /// Local key of an assigned-key item: the source tuple with every
    /// embedded reference replaced by the local key of its target.
    fn assigned_key(
        &mut self,
        store: &dyn SyncStore,
        metadata: &MetadataStore<'_>,
        schema: &EntitySchema,
        source_key: &EntityKey,
        data: &ItemChangeData,
    ) -> Result<EntityKey, SyncError> {
        let mut parts = source_key.clone().into_parts();
        for (index, field) in schema.key_references() {
            let unresolved = || SyncError::UnresolvedKey {
                type_name: schema.name.to_string(),
                field: field.name.clone(),
            };
            let target_type = field.reference_target().ok_or_else(unresolved)?;
            let identity = data.references.get(&field.name).ok_or_else(unresolved)?;
            let target = self
                .key_map
                .resolve(metadata, target_type, identity)?
                .ok_or_else(unresolved)?;
            let slot = parts.get_mut(index).ok_or_else(unresolved)?;
            *slot = FieldValue::Ref(target);
        }
        Ok(store.create_key_from_tuple(&schema.name, parts)?)
    }

    /// Writes scalars and resolvable references; queues the rest.
    fn write_entity(
        &mut self,
        store: &dyn SyncStore,
        metadata: &MetadataStore<'_>,
        schema: &EntitySchema,
        key: &EntityKey,
        data: &ItemChangeData,
    ) -> Result<(), SyncError> {
        let mut entity = Entity::new(schema.name.clone(), key.clone());
        for field in &schema.fields {
            let value = match field.reference_target() {
                None => data.fields.get(&field.name).cloned().unwrap_or(FieldValue::Null),
                Some(target_type) => {
                    self.key_map.clear_dependencies(&schema.name, key, &field.name);
                    match data.references.get(&field.name) {
                        None => FieldValue::Null,
                        Some(identity) if identity.is_none() => FieldValue::Null,
                        Some(identity) => match self.key_map.resolve(metadata, target_type, identity)? {
                            Some(target) => FieldValue::Ref(target),
                            None => {
                                self.key_map.register_dependency(KeyDependency {
                                    pending_type: schema.name.clone(),
                                    pending_key: key.clone(),
                                    field: field.name.clone(),
                                    identity: identity.clone(),
                                });
                                self.stats.deferred_references += 1;
                                FieldValue::Null
                            }
                        },
                    }
                }
            };
            entity.set(&field.name, value);
        }
        store.put_entity(&entity)?;
        Ok(())
    }

    /// True if the source had seen the local item's current version.
    fn source_knew(&self, batch: &ChangeBatch, meta: &SyncMetadata) -> Result<bool, SyncError> {
        let version = meta.relevant_version();
        let (replica, tick) = self
            .knowledge
            .resolve_version(&version)
            .ok_or(SyncError::UnknownReplicaKey(version.replica_key))?;
        Ok(batch.made_with_knowledge.contains(&replica, &meta.global_id, tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchGroup;
    use crate::change::{ChangeDataRetriever, Identity};
    use crate::id::ReplicaIdentity;
    use replisync_store::{EntityStore, FieldDef, MemoryStore, Schema};
    use std::collections::BTreeMap;

    struct Source {
        replica: ReplicaIdentity,
        knowledge: Knowledge,
    }

    impl Source {
        fn new() -> Self {
            let replica = ReplicaIdentity::generate();
            Self {
                replica,
                knowledge: Knowledge::new(replica),
            }
        }

        fn batch(&mut self, tick: u64, items: Vec<ItemChangeData>) -> (ChangeBatch, ChangeDataRetriever) {
            self.knowledge.set_local_tick(tick);
            let mut retriever = ChangeDataRetriever::new();
            let changes = items.iter().map(|i| i.descriptor.clone()).collect();
            for item in items {
                retriever.insert(item);
            }
            let batch = ChangeBatch {
                source: self.replica,
                sequence: 0,
                group: BatchGroup::Unordered,
                changes,
                learned_knowledge: self.knowledge.empty_like(),
                made_with_knowledge: self.knowledge.clone(),
                is_last_batch: true,
            };
            (batch, retriever)
        }

        fn author(&self, tick: u64, change: u64, name: &str) -> ItemChangeData {
            let mut fields = BTreeMap::new();
            fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
            ItemChangeData {
                descriptor: ChangeDescriptor {
                    global_id: GlobalId::for_replica(1, &self.replica, tick),
                    kind: ChangeKind::Update,
                    creation_version: Version::local(tick),
                    change_version: Version::local(change),
                },
                key: Some(EntityKey::generated(tick as i64)),
                fields,
                references: BTreeMap::new(),
            }
        }

        fn book(&self, tick: u64, author_tick: u64) -> ItemChangeData {
            let mut references = BTreeMap::new();
            references.insert(
                "author".to_string(),
                Identity {
                    global_id: Some(GlobalId::for_replica(1, &self.replica, author_tick)),
                    local_key: Some(EntityKey::generated(author_tick as i64)),
                },
            );
            ItemChangeData {
                descriptor: ChangeDescriptor {
                    global_id: GlobalId::for_replica(2, &self.replica, tick),
                    kind: ChangeKind::Update,
                    creation_version: Version::local(tick),
                    change_version: Version::local(tick),
                },
                key: Some(EntityKey::generated(tick as i64)),
                fields: BTreeMap::new(),
                references,
            }
        }
    }

    fn destination() -> (MemoryStore, ChangeApplier) {
        let schema = Schema::new(vec![
            EntitySchema::generated("Author", 1).with_field(FieldDef::scalar("name")),
            EntitySchema::generated("Book", 2).with_field(FieldDef::reference("author", "Author")),
        ])
        .unwrap();
        let registry = Arc::new(TypeRegistry::build(&schema).unwrap());
        let store = MemoryStore::new(schema);
        let applier = ChangeApplier::new(registry, Knowledge::new(ReplicaIdentity::generate()), 8);
        (store, applier)
    }

    fn authors(store: &MemoryStore) -> Vec<Entity> {
        store.query_all_ordered(&TypeName::from("Author"), None).unwrap()
    }

    #[test]
    fn test_create_then_replay_is_noop() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let (batch, data) = source.batch(1, vec![source.author(1, 1, "Le Guin")]);

        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();

        assert_eq!(applier.stats().created, 1);
        assert_eq!(applier.stats().skipped, 1);
        let stored = authors(&store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("name"), Some(&FieldValue::Text("Le Guin".into())));
    }

    #[test]
    fn test_forward_reference_is_backfilled() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let (first, first_data) = source.batch(2, vec![source.book(2, 1)]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &first, &first_data, &mut NoopCallbacks)
            .unwrap();
        assert_eq!(applier.pending_references(), 1);

        let (second, second_data) = source.batch(2, vec![source.author(1, 1, "Banks")]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &second, &second_data, &mut NoopCallbacks)
            .unwrap();
        assert_eq!(applier.pending_references(), 0);

        let author_key = authors(&store)[0].key.clone();
        let books = store.query_all_ordered(&TypeName::from("Book"), None).unwrap();
        assert_eq!(books[0].get("author"), Some(&FieldValue::Ref(author_key)));
        let (_, stats) = applier.finish(UnresolvedReferencePolicy::Fail).unwrap();
        assert_eq!(stats.deferred_references, 1);
    }

    #[test]
    fn test_unresolved_reference_policy() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let (batch, data) = source.batch(2, vec![source.book(2, 1)]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();
        assert!(matches!(
            applier.finish(UnresolvedReferencePolicy::Fail),
            Err(SyncError::UnresolvedReference { count: 1 })
        ));

        let (store, mut applier) = destination();
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();
        let (_, stats) = applier.finish(UnresolvedReferencePolicy::LeaveNull).unwrap();
        assert_eq!(stats.unresolved_references, 1);
    }

    #[test]
    fn test_unknown_item_rejected() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let (mut batch, data) = source.batch(1, vec![]);
        batch.changes.push(ChangeDescriptor::unknown(GlobalId::new(1, 1, 1)));
        assert!(matches!(
            applier.apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks),
            Err(SyncError::UnsupportedAction { .. })
        ));
    }

    #[test]
    fn test_missing_payload_fails() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let item = source.author(1, 1, "x");
        let (batch, _) = source.batch(1, vec![item]);
        assert!(matches!(
            applier.apply_batch(
                &store,
                ConflictPolicy::SourceWins,
                &batch,
                &ChangeDataRetriever::new(),
                &mut NoopCallbacks
            ),
            Err(SyncError::MissingChangeData(_))
        ));
    }

    struct KeepLocal {
        seen: usize,
    }

    impl SyncCallbacks for KeepLocal {
        fn on_conflict(&mut self, conflict: &ItemConflict) -> ConflictResolution {
            assert!(conflict.local.is_some());
            self.seen += 1;
            ConflictResolution::DestinationWins
        }
    }

    #[test]
    fn test_concurrent_update_conflict() {
        let (store, mut applier) = destination();
        let mut first = Source::new();
        let (batch, data) = first.batch(1, vec![first.author(1, 1, "original")]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();

        // A second source that never saw the first one's change.
        let mut other = Source::new();
        let mut item = first.author(1, 1, "rival");
        item.descriptor.creation_version = Version::local(1);
        item.descriptor.change_version = Version::local(5);
        let (rival, rival_data) = other.batch(5, vec![item]);

        let mut callbacks = KeepLocal { seen: 0 };
        applier
            .apply_batch(&store, ConflictPolicy::Callback, &rival, &rival_data, &mut callbacks)
            .unwrap();
        assert_eq!(callbacks.seen, 1);
        assert_eq!(applier.stats().conflicts, 1);
        assert_eq!(authors(&store)[0].get("name"), Some(&FieldValue::Text("original".into())));

        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &rival, &rival_data, &mut NoopCallbacks)
            .unwrap();
        assert_eq!(applier.stats().conflicts, 2);
        assert_eq!(authors(&store)[0].get("name"), Some(&FieldValue::Text("rival".into())));
    }

    #[test]
    fn test_delete_removes_and_tombstones() {
        let (store, mut applier) = destination();
        let mut source = Source::new();
        let (batch, data) = source.batch(1, vec![source.author(1, 1, "gone")]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();

        let delete = ItemChangeData::deleted(ChangeDescriptor {
            global_id: GlobalId::for_replica(1, &source.replica, 1),
            kind: ChangeKind::Delete,
            creation_version: Version::local(1),
            change_version: Version::local(4),
        });
        let (batch, data) = source.batch(4, vec![delete]);
        applier
            .apply_batch(&store, ConflictPolicy::SourceWins, &batch, &data, &mut NoopCallbacks)
            .unwrap();
        assert!(authors(&store).is_empty());
        assert_eq!(applier.stats().deleted, 1);
        assert_eq!(applier.stats().conflicts, 0);

        let meta = MetadataStore::new(&store, 8)
            .metadata_by_id(&GlobalId::for_replica(1, &source.replica, 1))
            .unwrap()
            .unwrap();
        assert!(meta.is_tombstone);
        let (replica, tick) = applier
            .knowledge()
            .resolve_version(&meta.relevant_version())
            .unwrap();
        assert_eq!((replica, tick), (source.replica, 4));
    }
}
