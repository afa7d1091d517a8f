//! Entity values, keys and instances shared by the store and the sync engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StoreError;

/// Name of an entity type in the schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeName(String);

impl TypeName {
    /// Creates a type name.
    pub fn new(name: impl Into<String>) -> Self {
        TypeName(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        TypeName(s.to_string())
    }
}

/// A single field value.
///
/// `Ref` holds the local key of another entity; the referenced type is
/// given by the field definition, not by the value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    /// No value / unset reference.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Reference to another entity by its local key.
    Ref(EntityKey),
}

impl FieldValue {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the referenced key if this is a `Ref`.
    pub fn as_ref_key(&self) -> Option<&EntityKey> {
        match self {
            FieldValue::Ref(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            FieldValue::Ref(k) => write!(f, "&{}", k),
        }
    }
}

/// Local identity of an entity: the tuple of its key field values.
///
/// Store-generated keys are a single `Int`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(Vec<FieldValue>);

impl EntityKey {
    /// Creates a key from its parts.
    pub fn new(parts: Vec<FieldValue>) -> Self {
        EntityKey(parts)
    }

    /// Creates the single-part key used for store-generated identities.
    pub fn generated(value: i64) -> Self {
        EntityKey(vec![FieldValue::Int(value)])
    }

    /// Returns the key parts.
    pub fn parts(&self) -> &[FieldValue] {
        &self.0
    }

    /// Consumes the key and returns its parts.
    pub fn into_parts(self) -> Vec<FieldValue> {
        self.0
    }

    /// Number of parts in the key.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Serializes the key for use inside a KV store key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a key written by [`EntityKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

/// A stored entity instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type.
    pub type_name: TypeName,
    /// Local key.
    pub key: EntityKey,
    /// Non-key field values by field name.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    /// Creates an entity with no fields set.
    pub fn new(type_name: TypeName, key: EntityKey) -> Self {
        Self {
            type_name,
            key,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Returns the value of a field, `None` if it was never set.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field value.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }
}

/// Predicate over entities used to narrow queries and sync scopes.
pub type EntityFilter = dyn Fn(&Entity) -> bool + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bytes_round_trip() {
        let key = EntityKey::new(vec![
            FieldValue::Ref(EntityKey::generated(7)),
            FieldValue::Int(3),
        ]);
        let bytes = key.to_bytes().unwrap();
        assert_eq!(EntityKey::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn test_key_display() {
        let key = EntityKey::new(vec![FieldValue::Text("a".into()), FieldValue::Int(2)]);
        assert_eq!(key.to_string(), "(\"a\", 2)");
    }

    #[test]
    fn test_entity_fields() {
        let mut e = Entity::new(TypeName::from("Book"), EntityKey::generated(1))
            .with_field("title", FieldValue::Text("Dune".into()));
        assert_eq!(e.get("title"), Some(&FieldValue::Text("Dune".into())));
        e.set("title", FieldValue::Null);
        assert!(e.get("title").unwrap().is_null());
        assert!(e.get("missing").is_none());
    }

    #[test]
    fn test_keys_order_by_parts() {
        let a = EntityKey::generated(1);
        let b = EntityKey::generated(2);
        assert!(a < b);
        assert_eq!(a.arity(), 1);
    }
}
