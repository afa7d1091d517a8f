//! Entity store collaborator.
//!
//! Entities live in the KV store under `ent/<type tag><key bytes>`. Any type
//! that can hand out a [`KvStore`] and a [`Schema`] gets the full
//! [`EntityStore`] surface through [`KvBacked`], so the base store and its
//! transactions share one implementation.

use std::sync::Arc;

use crate::error::StoreError;
use crate::kvstore::{BatchOp, KvPair, KvStore, MemoryKvStore, Value};
use crate::schema::{EntitySchema, KeyGeneration, Schema};
use crate::types::{Entity, EntityFilter, EntityKey, FieldValue, TypeName};

const ENTITY_PREFIX: &[u8] = b"ent/";
const KEY_SEQUENCE_PREFIX: &[u8] = b"keyseq/";
const TICK_SEQUENCE_PREFIX: &[u8] = b"tick/";

/// Entity-level operations consumed by the sync engine.
pub trait EntityStore: Send + Sync {
    /// The schema this store was opened with.
    fn schema(&self) -> &Schema;

    /// Creates an empty entity and returns its key.
    ///
    /// Generated-key types mint a key when `key` is `None`; assigned-key
    /// types require one.
    fn create_entity(&self, type_name: &TypeName, key: Option<EntityKey>)
        -> Result<EntityKey, StoreError>;

    /// Fetches one entity.
    fn get_by_key(&self, type_name: &TypeName, key: &EntityKey)
        -> Result<Option<Entity>, StoreError>;

    /// Fetches every entity in `keys` that exists. Order is unspecified.
    fn get_by_keys(&self, type_name: &TypeName, keys: &[EntityKey])
        -> Result<Vec<Entity>, StoreError>;

    /// Inserts or overwrites an entity.
    fn put_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Removes an entity. Returns false if it did not exist.
    fn remove_entity(&self, type_name: &TypeName, key: &EntityKey) -> Result<bool, StoreError>;

    /// Returns all entities of a type ordered by key, optionally filtered.
    fn query_all_ordered(
        &self,
        type_name: &TypeName,
        filter: Option<&EntityFilter>,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Atomically reserves the next logical tick for `scope`.
    fn generate_tick(&self, scope: &str) -> Result<i64, StoreError>;

    /// Returns the last tick reserved for `scope`, 0 if none.
    fn last_generated_tick(&self, scope: &str) -> Result<i64, StoreError>;

    /// Builds a validated key for `type_name` from a raw tuple.
    fn create_key_from_tuple(
        &self,
        type_name: &TypeName,
        tuple: Vec<FieldValue>,
    ) -> Result<EntityKey, StoreError>;
}

/// Anything that exposes a KV store plus a schema.
pub trait KvBacked: Send + Sync {
    /// Underlying KV store.
    fn kv(&self) -> &dyn KvStore;

    /// Schema used to validate entities.
    fn schema_ref(&self) -> &Schema;
}

fn entity_prefix(schema: &EntitySchema) -> Vec<u8> {
    let mut prefix = ENTITY_PREFIX.to_vec();
    prefix.extend_from_slice(&schema.type_tag.to_be_bytes());
    prefix
}

fn entity_key(schema: &EntitySchema, key: &EntityKey) -> Result<Vec<u8>, StoreError> {
    let mut k = entity_prefix(schema);
    k.extend_from_slice(&key.to_bytes()?);
    Ok(k)
}

fn check_arity(schema: &EntitySchema, key: &EntityKey) -> Result<(), StoreError> {
    if key.arity() != schema.key_arity() {
        return Err(StoreError::KeyArity {
            type_name: schema.name.to_string(),
            expected: schema.key_arity(),
            got: key.arity(),
        });
    }
    Ok(())
}

fn tick_sequence(scope: &str) -> Vec<u8> {
    let mut name = TICK_SEQUENCE_PREFIX.to_vec();
    name.extend_from_slice(scope.as_bytes());
    name
}

fn to_signed_tick(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::KvError("tick sequence exhausted".to_string()))
}

impl<T: KvBacked> EntityStore for T {
    fn schema(&self) -> &Schema {
        self.schema_ref()
    }

    fn create_entity(
        &self,
        type_name: &TypeName,
        key: Option<EntityKey>,
    ) -> Result<EntityKey, StoreError> {
        let schema = self.schema_ref().get(type_name)?;
        let key = match (schema.key_generation, key) {
            (_, Some(key)) => {
                check_arity(schema, &key)?;
                key
            }
            (KeyGeneration::Generated, None) => {
                let mut seq = KEY_SEQUENCE_PREFIX.to_vec();
                seq.extend_from_slice(&schema.type_tag.to_be_bytes());
                let next = self.kv().next_sequence(&seq)?;
                EntityKey::generated(to_signed_tick(next)?)
            }
            (KeyGeneration::Assigned, None) => {
                return Err(StoreError::KeyRequired(type_name.to_string()));
            }
        };

        let k = entity_key(schema, &key)?;
        if self.kv().contains_key(&k)? {
            return Err(StoreError::EntityExists {
                type_name: type_name.to_string(),
                key: key.to_string(),
            });
        }
        let entity = Entity::new(type_name.clone(), key.clone());
        self.kv().put(k, bincode::serialize(&entity)?)?;
        Ok(key)
    }

    fn get_by_key(
        &self,
        type_name: &TypeName,
        key: &EntityKey,
    ) -> Result<Option<Entity>, StoreError> {
        let schema = self.schema_ref().get(type_name)?;
        match self.kv().get(&entity_key(schema, key)?)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_by_keys(
        &self,
        type_name: &TypeName,
        keys: &[EntityKey],
    ) -> Result<Vec<Entity>, StoreError> {
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entity) = self.get_by_key(type_name, key)? {
                result.push(entity);
            }
        }
        Ok(result)
    }

    fn put_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let schema = self.schema_ref().get(&entity.type_name)?;
        check_arity(schema, &entity.key)?;
        self.kv()
            .put(entity_key(schema, &entity.key)?, bincode::serialize(entity)?)
    }

    fn remove_entity(&self, type_name: &TypeName, key: &EntityKey) -> Result<bool, StoreError> {
        let schema = self.schema_ref().get(type_name)?;
        let k = entity_key(schema, key)?;
        if !self.kv().contains_key(&k)? {
            return Ok(false);
        }
        self.kv().delete(&k)?;
        Ok(true)
    }

    fn query_all_ordered(
        &self,
        type_name: &TypeName,
        filter: Option<&EntityFilter>,
    ) -> Result<Vec<Entity>, StoreError> {
        let schema = self.schema_ref().get(type_name)?;
        let mut entities = Vec::new();
        for (_, bytes) in self.kv().scan_prefix(&entity_prefix(schema))? {
            let entity: Entity = bincode::deserialize(&bytes)?;
            if filter.map_or(true, |f| f(&entity)) {
                entities.push(entity);
            }
        }
        entities.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entities)
    }

    fn generate_tick(&self, scope: &str) -> Result<i64, StoreError> {
        to_signed_tick(self.kv().next_sequence(&tick_sequence(scope))?)
    }

    fn last_generated_tick(&self, scope: &str) -> Result<i64, StoreError> {
        to_signed_tick(self.kv().current_sequence(&tick_sequence(scope))?)
    }

    fn create_key_from_tuple(
        &self,
        type_name: &TypeName,
        tuple: Vec<FieldValue>,
    ) -> Result<EntityKey, StoreError> {
        let schema = self.schema_ref().get(type_name)?;
        let key = EntityKey::new(tuple);
        check_arity(schema, &key)?;
        Ok(key)
    }
}

/// Store handle over a shared in-memory KV store.
///
/// Writes made directly through this handle are not transactional; sync
/// sessions go through [`crate::SessionHost::begin`].
#[derive(Clone)]
pub struct MemoryStore {
    kv: Arc<MemoryKvStore>,
    schema: Arc<Schema>,
}

impl MemoryStore {
    /// Creates a store over a fresh, empty KV store.
    pub fn new(schema: Schema) -> Self {
        Self {
            kv: Arc::new(MemoryKvStore::new()),
            schema: Arc::new(schema),
        }
    }

    /// Creates a store over an existing KV store (e.g. a restored snapshot).
    pub fn with_kv(kv: Arc<MemoryKvStore>, schema: Arc<Schema>) -> Self {
        Self { kv, schema }
    }

    /// The shared KV store.
    pub fn kv_store(&self) -> &Arc<MemoryKvStore> {
        &self.kv
    }

    /// The shared schema.
    pub fn schema_arc(&self) -> &Arc<Schema> {
        &self.schema
    }
}

impl KvBacked for MemoryStore {
    fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    fn schema_ref(&self) -> &Schema {
        &self.schema
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        self.kv.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.kv.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.kv.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        self.kv.scan_prefix(prefix)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        self.kv.scan_range(start, end)
    }

    fn scan_range_limit(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        self.kv.scan_range_limit(start, end, limit)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.kv.contains_key(key)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.kv.write_batch(ops)
    }

    fn next_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        self.kv.next_sequence(name)
    }

    fn current_sequence(&self, name: &[u8]) -> Result<u64, StoreError> {
        self.kv.current_sequence(name)
    }
}
