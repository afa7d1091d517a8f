//! Source-side change enumeration.
//!
//! Types are walked in key-dependency order. Within a type, metadata rows
//! are scanned in global id order and every item whose relevant version the
//! destination does not know is emitted. Once a group is full, the outgoing
//! references of its items are resolved to global ids; referenced entities
//! outside the sync scope are queued for forced inclusion and sent in
//! unordered groups after all types are done. Forced targets that an item
//! embeds in its key cannot wait that long: they go out in unordered groups
//! just ahead of the group that needs them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use replisync_store::{Entity, EntityFilter, EntityKey, EntitySchema, FieldValue, SyncStore, TypeName};
use tracing::debug;

use crate::batch::BatchGroup;
use crate::change::{ChangeDescriptor, ChangeKind, Identity, ItemChangeData};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::id::GlobalId;
use crate::knowledge::Knowledge;
use crate::metadata::{MetadataStore, SyncMetadata};
use crate::registry::TypeRegistry;

/// Which entities a source session offers.
#[derive(Clone, Default)]
pub struct SyncScope {
    included: Option<BTreeSet<TypeName>>,
    filters: BTreeMap<TypeName, Arc<EntityFilter>>,
}

impl SyncScope {
    /// Every type, unfiltered.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the named types.
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            included: Some(types.into_iter().map(|t| TypeName::new(t.as_ref())).collect()),
            filters: BTreeMap::new(),
        }
    }

    /// Scope described by `included_types`.
    pub fn from_config(config: &SyncConfig) -> Self {
        match &config.included_types {
            Some(types) => Self::only(types),
            None => Self::all(),
        }
    }

    /// Restricts one type to entities accepted by `filter`.
    pub fn with_filter<F>(mut self, type_name: &str, filter: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(TypeName::from(type_name), Arc::new(filter));
        self
    }

    /// True if the type is offered at all.
    pub fn includes(&self, type_name: &TypeName) -> bool {
        self.included
            .as_ref()
            .map_or(true, |set| set.contains(type_name))
    }

    /// Filter for a type, if any.
    pub fn filter_for(&self, type_name: &TypeName) -> Option<&EntityFilter> {
        self.filters.get(type_name).map(|f| f.as_ref())
    }

    /// True if the entity would be sent without forcing.
    pub fn admits(&self, entity: &Entity) -> bool {
        self.includes(&entity.type_name)
            && self
                .filter_for(&entity.type_name)
                .map_or(true, |filter| filter(entity))
    }

    /// True if every registered type is offered unfiltered.
    pub fn is_full(&self, registry: &TypeRegistry) -> bool {
        self.filters.is_empty()
            && registry
                .ordered()
                .iter()
                .all(|t| self.includes(&t.name))
    }
}

impl fmt::Debug for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScope")
            .field("included", &self.included)
            .field("filtered", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One group of detected changes, ready for the batch builder.
#[derive(Debug, Clone)]
pub struct DetectedChanges {
    /// Ordered range or unordered group.
    pub group: BatchGroup,
    /// Payloads in emission order.
    pub items: Vec<ItemChangeData>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Scan {
        type_index: usize,
        next: Option<GlobalId>,
    },
    Forced,
    Done,
}

/// Enumerates changes a destination is missing. Never writes.
pub struct ChangeDetector {
    registry: Arc<TypeRegistry>,
    scope: SyncScope,
    lookup_batch_size: usize,
    phase: Phase,
    forced: BTreeMap<usize, BTreeSet<EntityKey>>,
    emitted: HashSet<GlobalId>,
    ready: VecDeque<DetectedChanges>,
}

impl ChangeDetector {
    /// Starts an enumeration over `scope`.
    pub fn new(registry: Arc<TypeRegistry>, scope: SyncScope, lookup_batch_size: usize) -> Self {
        Self {
            registry,
            scope,
            lookup_batch_size,
            phase: Phase::Scan {
                type_index: 0,
                next: None,
            },
            forced: BTreeMap::new(),
            emitted: HashSet::new(),
            ready: VecDeque::new(),
        }
    }

    /// Number of entities currently queued for forced inclusion.
    pub fn forced_count(&self) -> usize {
        self.forced.values().map(BTreeSet::len).sum()
    }

    /// Next group of at most `max_items` changes, `None` once everything
    /// has been offered.
    ///
    /// `destination` must already be mapped into this replica's key space.
    pub fn next_changes(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        max_items: usize,
    ) -> Result<Option<DetectedChanges>, SyncError> {
        let max_items = max_items.max(1);
        let registry = Arc::clone(&self.registry);
        loop {
            if let Some(ready) = self.ready.pop_front() {
                return Ok(Some(ready));
            }
            match self.phase {
                Phase::Scan { type_index, next } => {
                    let Some(schema) = registry.ordered().get(type_index) else {
                        self.phase = Phase::Forced;
                        continue;
                    };
                    if !self.scope.includes(&schema.name) {
                        self.phase = Phase::Scan {
                            type_index: type_index + 1,
                            next: None,
                        };
                        continue;
                    }
                    let lower = next.unwrap_or_else(|| GlobalId::lower_bound(schema.type_tag));
                    let (mut items, upper, resume) =
                        self.scan_type(store, schema, destination, lower, max_items)?;
                    self.phase = match resume {
                        Some(next) => Phase::Scan {
                            type_index,
                            next: Some(next),
                        },
                        None => Phase::Scan {
                            type_index: type_index + 1,
                            next: None,
                        },
                    };
                    if items.is_empty() {
                        continue;
                    }
                    self.resolve_references(store, destination, &mut items)?;
                    debug!(
                        type_name = %schema.name,
                        items = items.len(),
                        forced = self.forced_count(),
                        "type changes detected"
                    );
                    // Items a filter rejected must stay unknown to the destination.
                    let group = match self.scope.filter_for(&schema.name) {
                        Some(_) => BatchGroup::Unordered,
                        None => BatchGroup::Ordered { lower, upper },
                    };
                    self.queue(store, destination, DetectedChanges { group, items }, max_items)?;
                }
                Phase::Forced => match self.next_forced(store, destination, max_items)? {
                    Some(items) => {
                        debug!(items = items.len(), "forced changes detected");
                        let detected = DetectedChanges {
                            group: BatchGroup::Unordered,
                            items,
                        };
                        self.queue(store, destination, detected, max_items)?;
                    }
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Queues `detected`, preceded by the forced items its keys depend on.
    fn queue(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        detected: DetectedChanges,
        max_items: usize,
    ) -> Result<(), SyncError> {
        let prerequisites = self.key_prerequisites(store, destination, &detected.items)?;
        if !prerequisites.is_empty() {
            debug!(items = prerequisites.len(), "key reference targets sent ahead");
        }
        for chunk in prerequisites.chunks(max_items) {
            self.ready.push_back(DetectedChanges {
                group: BatchGroup::Unordered,
                items: chunk.to_vec(),
            });
        }
        self.ready.push_back(detected);
        Ok(())
    }

    /// Takes the forced targets referenced from the keys of `items` out of
    /// the forced queue, along with whatever their own keys reference.
    /// The result lists parents before children.
    fn key_prerequisites(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        items: &[ItemChangeData],
    ) -> Result<Vec<ItemChangeData>, SyncError> {
        let registry = Arc::clone(&self.registry);
        let metadata = MetadataStore::new(store, self.lookup_batch_size);
        let mut levels: Vec<Vec<ItemChangeData>> = Vec::new();
        let mut wanted = self.forced_key_targets(items)?;
        while !wanted.is_empty() {
            let mut level = Vec::new();
            for (position, key) in wanted {
                if !self.unforce_at(position, &key) {
                    continue;
                }
                let Some(schema) = registry.ordered().get(position) else {
                    continue;
                };
                if let Some(data) = self.forced_item(store, destination, &metadata, schema, &key)? {
                    level.push(data);
                }
            }
            if level.is_empty() {
                break;
            }
            self.resolve_references(store, destination, &mut level)?;
            wanted = self.forced_key_targets(&level)?;
            levels.push(level);
        }
        Ok(levels.into_iter().rev().flatten().collect())
    }

    fn forced_key_targets(&self, items: &[ItemChangeData]) -> Result<Vec<(usize, EntityKey)>, SyncError> {
        let mut targets = Vec::new();
        for item in items {
            let schema = self.registry.by_tag(item.descriptor.global_id.type_tag())?;
            for (_, field) in schema.key_references() {
                let (Some(target), Some(identity)) = (field.reference_target(), item.references.get(&field.name))
                else {
                    continue;
                };
                let (Some(position), Some(key)) = (self.registry.position(target), &identity.local_key) else {
                    continue;
                };
                if self.forced.get(&position).map_or(false, |keys| keys.contains(key)) {
                    targets.push((position, key.clone()));
                }
            }
        }
        Ok(targets)
    }

    /// Scans one type from `lower`. Returns the items, the inclusive upper
    /// bound covered, and where to resume if the type is not exhausted.
    fn scan_type(
        &mut self,
        store: &dyn SyncStore,
        schema: &EntitySchema,
        destination: &Knowledge,
        lower: GlobalId,
        max_items: usize,
    ) -> Result<(Vec<ItemChangeData>, GlobalId, Option<GlobalId>), SyncError> {
        let metadata = MetadataStore::new(store, self.lookup_batch_size);
        let mut items = Vec::new();
        let mut cursor = Some(lower);

        while let Some(start) = cursor {
            let page = metadata.ordered_metadata(schema.type_tag, start, max_items)?;
            let page_len = page.len();
            for meta in page {
                cursor = meta.global_id.next_id();
                if let Some(data) = self.consider(store, schema, destination, &meta)? {
                    items.push(data);
                }
                if items.len() >= max_items {
                    return Ok((items, meta.global_id, cursor));
                }
            }
            if page_len < max_items {
                break;
            }
        }
        Ok((items, GlobalId::upper_bound(schema.type_tag), None))
    }

    fn consider(
        &mut self,
        store: &dyn SyncStore,
        schema: &EntitySchema,
        destination: &Knowledge,
        meta: &SyncMetadata,
    ) -> Result<Option<ItemChangeData>, SyncError> {
        if self.emitted.contains(&meta.global_id) {
            return Ok(None);
        }
        if destination.contains_version(&meta.global_id, &meta.relevant_version()) {
            if let Some(key) = &meta.target_key {
                self.unforce(schema, key);
            }
            return Ok(None);
        }
        if meta.is_tombstone {
            self.emitted.insert(meta.global_id);
            return Ok(Some(ItemChangeData::deleted(descriptor_for(meta))));
        }
        let Some(key) = &meta.target_key else {
            return Ok(None);
        };
        // The row stays inside the ordered range the group learns. The entity
        // is gone without a recorded delete yet; draining that delete gives
        // the row a new version, which the destination will not know.
        let Some(entity) = store.get_by_key(&schema.name, key)? else {
            debug!(global_id = %meta.global_id, "metadata without entity, skipped");
            return Ok(None);
        };
        if let Some(filter) = self.scope.filter_for(&schema.name) {
            if !filter(&entity) {
                return Ok(None);
            }
        }
        self.unforce(schema, key);
        self.emitted.insert(meta.global_id);
        Ok(Some(snapshot(schema, meta, &entity)))
    }

    fn next_forced(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        max_items: usize,
    ) -> Result<Option<Vec<ItemChangeData>>, SyncError> {
        let registry = Arc::clone(&self.registry);
        let metadata = MetadataStore::new(store, self.lookup_batch_size);
        let mut items = Vec::new();

        while items.len() < max_items {
            let Some((position, key)) = self.pop_forced() else {
                break;
            };
            let Some(schema) = registry.ordered().get(position) else {
                continue;
            };
            if let Some(data) = self.forced_item(store, destination, &metadata, schema, &key)? {
                items.push(data);
            }
        }

        if items.is_empty() {
            return Ok(None);
        }
        self.resolve_references(store, destination, &mut items)?;
        Ok(Some(items))
    }

    /// Snapshot of a forced entity, unless it was already sent or is known.
    fn forced_item(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        metadata: &MetadataStore<'_>,
        schema: &EntitySchema,
        key: &EntityKey,
    ) -> Result<Option<ItemChangeData>, SyncError> {
        let Some(meta) = metadata.metadata_by_key(schema.type_tag, key)? else {
            return Ok(None);
        };
        if self.emitted.contains(&meta.global_id)
            || destination.contains_version(&meta.global_id, &meta.relevant_version())
        {
            return Ok(None);
        }
        let Some(entity) = store.get_by_key(&schema.name, key)? else {
            return Ok(None);
        };
        self.emitted.insert(meta.global_id);
        Ok(Some(snapshot(schema, &meta, &entity)))
    }

    /// Attaches global ids to outgoing references and queues out-of-scope
    /// targets for forced inclusion.
    fn resolve_references(
        &mut self,
        store: &dyn SyncStore,
        destination: &Knowledge,
        items: &mut [ItemChangeData],
    ) -> Result<(), SyncError> {
        let registry = Arc::clone(&self.registry);
        let mut wanted: HashMap<TypeName, BTreeSet<EntityKey>> = HashMap::new();
        for item in items.iter() {
            let schema = registry.by_tag(item.descriptor.global_id.type_tag())?;
            for (field, identity) in &item.references {
                if let (Some(target), Some(key)) = (reference_target(schema, field), &identity.local_key) {
                    wanted.entry(target.clone()).or_default().insert(key.clone());
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let metadata = MetadataStore::new(store, self.lookup_batch_size);
        let mut resolved: HashMap<(TypeName, EntityKey), GlobalId> = HashMap::new();
        for (target, keys) in wanted {
            let target_schema = registry.by_name(&target)?;
            let keys: Vec<EntityKey> = keys.into_iter().collect();
            for meta in metadata.metadata_by_keys(target_schema.type_tag, &keys)? {
                let Some(key) = meta.target_key.clone() else {
                    continue;
                };
                if !self.emitted.contains(&meta.global_id)
                    && !destination.contains_version(&meta.global_id, &meta.relevant_version())
                    && !self.in_scope(store, target_schema, &key)?
                {
                    self.force(target_schema, key.clone());
                }
                resolved.insert((target.clone(), key), meta.global_id);
            }
        }

        for item in items.iter_mut() {
            let schema = registry.by_tag(item.descriptor.global_id.type_tag())?;
            for (field, identity) in item.references.iter_mut() {
                if let (Some(target), Some(key)) = (reference_target(schema, field), &identity.local_key) {
                    identity.global_id = resolved.get(&(target.clone(), key.clone())).copied();
                }
            }
        }
        Ok(())
    }

    fn in_scope(&self, store: &dyn SyncStore, schema: &EntitySchema, key: &EntityKey) -> Result<bool, SyncError> {
        if !self.scope.includes(&schema.name) {
            return Ok(false);
        }
        if self.scope.filter_for(&schema.name).is_none() {
            return Ok(true);
        }
        Ok(store
            .get_by_key(&schema.name, key)?
            .map_or(false, |entity| self.scope.admits(&entity)))
    }

    fn force(&mut self, schema: &EntitySchema, key: EntityKey) {
        if let Some(position) = self.registry.position(&schema.name) {
            self.forced.entry(position).or_default().insert(key);
        }
    }

    fn unforce(&mut self, schema: &EntitySchema, key: &EntityKey) {
        if let Some(position) = self.registry.position(&schema.name) {
            self.unforce_at(position, key);
        }
    }

    /// Removes a queued key. Returns false if it was not queued.
    fn unforce_at(&mut self, position: usize, key: &EntityKey) -> bool {
        let Some(keys) = self.forced.get_mut(&position) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.forced.remove(&position);
        }
        removed
    }

    fn pop_forced(&mut self) -> Option<(usize, EntityKey)> {
        let mut entry = self.forced.first_entry()?;
        let position = *entry.key();
        let key = entry.get_mut().pop_first();
        if entry.get().is_empty() {
            entry.remove();
        }
        key.map(|k| (position, k))
    }
}

fn descriptor_for(meta: &SyncMetadata) -> ChangeDescriptor {
    ChangeDescriptor {
        global_id: meta.global_id,
        kind: if meta.is_tombstone {
            ChangeKind::Delete
        } else {
            ChangeKind::Update
        },
        creation_version: meta.creation_version,
        change_version: meta.relevant_version(),
    }
}

fn reference_target<'s>(schema: &'s EntitySchema, field: &str) -> Option<&'s TypeName> {
    schema
        .key_fields
        .iter()
        .chain(schema.fields.iter())
        .find(|f| f.name == field)
        .and_then(|f| f.reference_target())
}

/// Payload of a live item: scalar fields plus the local key of every reference.
fn snapshot(schema: &EntitySchema, meta: &SyncMetadata, entity: &Entity) -> ItemChangeData {
    let mut fields = BTreeMap::new();
    let mut references = BTreeMap::new();

    for (index, field) in schema.key_references() {
        let identity = match entity.key.parts().get(index).and_then(FieldValue::as_ref_key) {
            Some(key) => Identity::local(key.clone()),
            None => Identity::none(),
        };
        references.insert(field.name.clone(), identity);
    }
    for field in &schema.fields {
        let value = entity.get(&field.name).cloned().unwrap_or(FieldValue::Null);
        if field.reference_target().is_some() {
            let identity = match value.as_ref_key() {
                Some(key) => Identity::local(key.clone()),
                None => Identity::none(),
            };
            references.insert(field.name.clone(), identity);
        } else {
            fields.insert(field.name.clone(), value);
        }
    }

    ItemChangeData {
        descriptor: descriptor_for(meta),
        key: Some(entity.key.clone()),
        fields,
        references,
    }
}
