//! Error types for the storage subsystem.

use thiserror::Error;

/// Errors raised by the entity store, the key/value layer and transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// The entity type is not part of the schema.
    #[error("unknown entity type '{0}'")]
    UnknownType(String),

    /// Two schema entries share a name.
    #[error("entity type '{0}' is declared twice")]
    DuplicateType(String),

    /// Two schema entries share a type tag.
    #[error("type tag {tag} is used by both '{first}' and '{second}'")]
    DuplicateTypeTag {
        /// The clashing tag.
        tag: u32,
        /// First type using the tag.
        first: String,
        /// Second type using the tag.
        second: String,
    },

    /// A reference field points at a type missing from the schema.
    #[error("field '{field}' of '{type_name}' references unknown type '{target}'")]
    DanglingReference {
        /// Type declaring the field.
        type_name: String,
        /// Reference field name.
        field: String,
        /// Missing target type.
        target: String,
    },

    /// A key tuple has the wrong number of parts for its type.
    #[error("key for '{type_name}' needs {expected} part(s), got {got}")]
    KeyArity {
        /// Entity type.
        type_name: String,
        /// Expected key arity.
        expected: usize,
        /// Provided key arity.
        got: usize,
    },

    /// An assigned-key type was created without a key.
    #[error("entity type '{0}' does not generate keys; a key tuple is required")]
    KeyRequired(String),

    /// An entity with the same key already exists.
    #[error("entity {key} of type '{type_name}' already exists")]
    EntityExists {
        /// Entity type.
        type_name: String,
        /// Rendered key.
        key: String,
    },

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionClosed,

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
