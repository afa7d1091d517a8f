//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use replisync_engine::{
    sync_once, ConflictPolicy, MetadataManager, NoopCallbacks, SyncCallbacks, SyncConfig, SyncError,
    SyncMetadata, SyncProvider, SyncReport, SyncScope,
};
use replisync_store::{
    ChangeLog, ChangeNotification, Entity, EntityKey, EntitySchema, EntityStore, FieldDef, FieldValue,
    MemoryKvStore, MemoryStore, Schema, TypeName,
};

/// Author -> Book -> Chapter plus a self-referencing Person type.
pub fn test_schema() -> Schema {
    Schema::new(vec![
        EntitySchema::generated("Author", 1).with_field(FieldDef::scalar("name")),
        EntitySchema::generated("Book", 2)
            .with_field(FieldDef::scalar("title"))
            .with_field(FieldDef::reference("author", "Author")),
        EntitySchema::assigned(
            "Chapter",
            3,
            vec![FieldDef::reference("book", "Book"), FieldDef::scalar("number")],
        )
        .with_field(FieldDef::scalar("title")),
        EntitySchema::generated("Person", 4)
            .with_field(FieldDef::scalar("name"))
            .with_field(FieldDef::reference("mentor", "Person")),
    ])
    .expect("test schema is valid")
}

pub fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

/// One in-process replica: a store, its sync state and a provider.
pub struct Replica {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<MetadataManager>,
    pub provider: SyncProvider,
}

impl Replica {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::from_store(Arc::new(MemoryStore::new(test_schema())), config)
    }

    pub fn from_store(store: Arc<MemoryStore>, config: SyncConfig) -> Self {
        let manager = Arc::new(MetadataManager::open(store.clone(), config).expect("open manager"));
        Self {
            store,
            provider: SyncProvider::new(manager.clone()),
            manager,
        }
    }

    /// Reopens a replica from a snapshot file.
    pub fn restore(path: &std::path::Path, config: SyncConfig) -> Self {
        let kv = MemoryKvStore::load_snapshot(path).expect("load snapshot");
        let store = MemoryStore::with_kv(Arc::new(kv), Arc::new(test_schema()));
        Self::from_store(Arc::new(store), config)
    }

    pub fn save(&self, path: &std::path::Path) {
        self.store.kv_store().save_snapshot(path).expect("save snapshot");
    }

    pub fn insert(&self, type_name: &str, key: Option<EntityKey>, fields: Vec<(&str, FieldValue)>) -> EntityKey {
        let type_name = TypeName::from(type_name);
        let key = self.store.create_entity(&type_name, key).expect("create entity");
        let mut entity = Entity::new(type_name.clone(), key.clone());
        for (field, value) in fields {
            entity.set(field, value);
        }
        self.store.put_entity(&entity).expect("put entity");
        self.log(ChangeNotification::created(type_name, key.clone()));
        key
    }

    pub fn update(&self, type_name: &str, key: &EntityKey, field: &str, value: FieldValue) {
        let type_name = TypeName::from(type_name);
        let mut entity = self
            .store
            .get_by_key(&type_name, key)
            .expect("get entity")
            .expect("entity exists");
        entity.set(field, value);
        self.store.put_entity(&entity).expect("put entity");
        self.log(ChangeNotification::modified(type_name, key.clone()));
    }

    pub fn delete(&self, type_name: &str, key: &EntityKey) {
        let type_name = TypeName::from(type_name);
        self.store.remove_entity(&type_name, key).expect("remove entity");
        self.log(ChangeNotification::removed(type_name, key.clone()));
    }

    fn log(&self, note: ChangeNotification) {
        ChangeLog::append(self.store.as_ref(), &[note]).expect("append change log");
    }

    /// Turns pending change log entries into metadata.
    pub fn flush(&self) -> usize {
        self.manager.catch_up().expect("drain change log")
    }

    pub fn get(&self, type_name: &str, key: &EntityKey) -> Option<Entity> {
        self.store
            .get_by_key(&TypeName::from(type_name), key)
            .expect("get entity")
    }

    pub fn all(&self, type_name: &str) -> Vec<Entity> {
        self.store
            .query_all_ordered(&TypeName::from(type_name), None)
            .expect("query entities")
    }

    pub fn find(&self, type_name: &str, field: &str, value: &FieldValue) -> Option<Entity> {
        self.all(type_name)
            .into_iter()
            .find(|e| e.get(field) == Some(value))
    }

    pub fn metadata(&self, type_name: &str, key: &EntityKey) -> Option<SyncMetadata> {
        let tag = self
            .manager
            .registry()
            .by_name(&TypeName::from(type_name))
            .expect("known type")
            .type_tag;
        self.manager
            .metadata_store(self.store.as_ref())
            .metadata_by_key(tag, key)
            .expect("metadata lookup")
    }

    pub fn metadata_by_id(&self, id: &replisync_engine::GlobalId) -> Option<SyncMetadata> {
        self.manager
            .metadata_store(self.store.as_ref())
            .metadata_by_id(id)
            .expect("metadata lookup")
    }

    pub fn sync_to(&mut self, other: &mut Replica) -> SyncReport {
        self.try_sync_to(other, ConflictPolicy::SourceWins, SyncScope::all(), &mut NoopCallbacks)
            .expect("sync")
    }

    pub fn try_sync_to(
        &mut self,
        other: &mut Replica,
        policy: ConflictPolicy,
        scope: SyncScope,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<SyncReport, SyncError> {
        sync_once(&mut self.provider, &mut other.provider, policy, scope, callbacks)
    }

    /// Every entity rendered without generated keys or references, sorted,
    /// so replicas can be compared.
    pub fn contents(&self) -> Vec<String> {
        let mut rows = Vec::new();
        for schema in self.store.schema().types() {
            for entity in self.all(schema.name.as_str()) {
                let key_parts: Vec<String> = match schema.key_generation {
                    replisync_store::KeyGeneration::Assigned => entity
                        .key
                        .parts()
                        .iter()
                        .filter(|v| v.as_ref_key().is_none())
                        .map(|v| v.to_string())
                        .collect(),
                    replisync_store::KeyGeneration::Generated => Vec::new(),
                };
                let fields: Vec<String> = entity
                    .fields
                    .iter()
                    .filter(|(_, v)| v.as_ref_key().is_none())
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                rows.push(format!("{}[{}]{{{}}}", schema.name, key_parts.join(","), fields.join(",")));
            }
        }
        rows.sort();
        rows
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}
