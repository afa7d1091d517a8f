#![warn(missing_docs)]

//! replisync engine: knowledge-vector change detection, batching and remote change application

pub mod applier;
pub mod batch;
pub mod change;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod harness;
pub mod id;
pub mod keymap;
pub mod knowledge;
pub mod maintenance;
pub mod manager;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod tick;

pub use applier::{
    ApplyOutcome, ApplyStats, ChangeApplier, ConflictPolicy, ConflictResolution, ItemConflict, NoopCallbacks,
    SyncCallbacks,
};
pub use batch::{BatchBuilder, BatchGroup, ChangeBatch};
pub use change::{ChangeDataRetriever, ChangeDataSource, ChangeDescriptor, ChangeKind, Identity, ItemChangeData};
pub use config::{SyncConfig, UnresolvedReferencePolicy};
pub use detector::{ChangeDetector, DetectedChanges, SyncScope};
pub use error::SyncError;
pub use harness::{sync_once, SyncReport};
pub use id::{GlobalId, ReplicaIdentity};
pub use keymap::{KeyDependency, KeyMap};
pub use knowledge::{ClockVector, ForgottenKnowledge, Knowledge, ReplicaKeyMap, Version};
pub use maintenance::{MaintenanceHandle, MaintenanceSignal, MaintenanceStats, MaintenanceWorker};
pub use manager::MetadataManager;
pub use metadata::{MetadataStore, SyncMetadata};
pub use provider::{SessionRole, SyncProvider};
pub use registry::TypeRegistry;
pub use tick::TickGenerator;
