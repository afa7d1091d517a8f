//! Error types for the synchronization engine.

use replisync_store::StoreError;
use thiserror::Error;

use crate::id::GlobalId;

/// Errors that can occur while detecting, batching or applying changes.
///
/// Any error raised inside a session aborts the whole session transaction.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A global id or replica id could not be parsed.
    #[error("malformed identifier: {0}")]
    Format(String),

    /// A key-embedded reference of an incoming item could not be mapped.
    #[error("cannot build local key for '{type_name}': reference '{field}' is unresolved")]
    UnresolvedKey {
        /// Type of the item being created.
        type_name: String,
        /// Key field holding the reference.
        field: String,
    },

    /// The change kind cannot be applied.
    #[error("unsupported change for item {global_id}")]
    UnsupportedAction {
        /// Item the change refers to.
        global_id: GlobalId,
    },

    /// The underlying store failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Key-embedded references form a cycle between entity types.
    #[error("cyclic key dependency between types: {}", .types.join(", "))]
    CyclicKeyDependency {
        /// Types taking part in the cycle.
        types: Vec<String>,
    },

    /// The entity type is not registered.
    #[error("unknown entity type '{0}'")]
    UnknownType(String),

    /// No registered type carries this tag.
    #[error("unknown type tag {0}")]
    UnknownTypeTag(u32),

    /// A replica key has no identity in the knowledge it came with.
    #[error("replica key {0} is not present in the knowledge key map")]
    UnknownReplicaKey(u32),

    /// Every `u32` replica key is already taken.
    #[error("replica key space exhausted")]
    ReplicaKeysExhausted,

    /// References still pending when the session ended.
    #[error("{count} reference(s) could not be resolved before session end")]
    UnresolvedReference {
        /// Number of unresolved references.
        count: usize,
    },

    /// The change data source has no payload for an item.
    #[error("no change data for item {0}")]
    MissingChangeData(GlobalId),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// Session lifecycle misuse.
    #[error("session error: {0}")]
    Session(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A shared lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: SyncError = StoreError::UnknownType("Book".into()).into();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
        assert!(err.to_string().contains("Book"));
    }

    #[test]
    fn test_cycle_message_lists_types() {
        let err = SyncError::CyclicKeyDependency {
            types: vec!["A".into(), "B".into()],
        };
        assert_eq!(err.to_string(), "cyclic key dependency between types: A, B");
    }
}
