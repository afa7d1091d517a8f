#![warn(missing_docs)]

//! replisync storage subsystem: entity store, key/value extension area, buffered transactions, change log

pub mod changelog;
pub mod entity;
pub mod error;
pub mod kvstore;
pub mod schema;
pub mod transaction;
pub mod types;

pub use changelog::{ChangeLog, ChangeNotification, NotificationKind};
pub use entity::{EntityStore, KvBacked, MemoryStore};
pub use error::StoreError;
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use schema::{EntitySchema, FieldDef, FieldKind, KeyGeneration, Schema};
pub use transaction::{MemoryTransaction, SessionHost, StoreTransaction, SyncStore};
pub use types::{Entity, EntityFilter, EntityKey, FieldValue, TypeName};
