//! Replica-wide sync state: identity, ticks, knowledge and item metadata.
//!
//! The replica id, knowledge and forgotten knowledge live as blobs in the
//! store's extension area and are created on first open. Item metadata is
//! written through whatever transaction the caller passes in; knowledge is
//! only replaced by [`MetadataManager::commit_with_knowledge`], inside the
//! transaction whose rows it describes.
//!
//! Change log drains and destination sessions both write metadata rows, so
//! they take turns through a [`WriterGate`].

use std::sync::{Arc, Condvar, Mutex, RwLock};

use replisync_store::{
    ChangeLog, ChangeNotification, EntityKey, NotificationKind, SessionHost, StoreTransaction, SyncStore,
    TypeName,
};
use tracing::{debug, info};

use crate::change::{ChangeDescriptor, ChangeKind};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::id::ReplicaIdentity;
use crate::knowledge::{ForgottenKnowledge, Knowledge, Version};
use crate::metadata::{MetadataStore, SyncMetadata};
use crate::registry::TypeRegistry;
use crate::tick::TickGenerator;

const REPLICA_ID_KEY: &[u8] = b"ext/replica_id";
const KNOWLEDGE_KEY: &[u8] = b"ext/knowledge";
const FORGOTTEN_KNOWLEDGE_KEY: &[u8] = b"ext/forgotten_knowledge";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Writer {
    Idle,
    Draining,
    Applying,
}

/// Lets one metadata writer at a time run: a change log drain or a
/// destination session.
struct WriterGate {
    writer: Mutex<Writer>,
    released: Condvar,
}

impl WriterGate {
    fn new() -> Self {
        Self {
            writer: Mutex::new(Writer::Idle),
            released: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>, role: Writer) -> Result<WriterGuard, SyncError> {
        let writer = self
            .writer
            .lock()
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;
        let mut writer = self
            .released
            .wait_while(writer, |w| *w != Writer::Idle)
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;
        *writer = role;
        Ok(WriterGuard {
            gate: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        *writer = Writer::Idle;
        self.released.notify_all();
    }
}

/// Held by the current metadata writer; releases the gate on drop.
pub(crate) struct WriterGuard {
    gate: Arc<WriterGate>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

struct PersistedState {
    registry: TypeRegistry,
    replica: ReplicaIdentity,
    knowledge: Knowledge,
    forgotten: ForgottenKnowledge,
}

/// Owner of one replica's sync state.
pub struct MetadataManager {
    host: Arc<dyn SessionHost>,
    registry: Arc<TypeRegistry>,
    config: SyncConfig,
    replica: ReplicaIdentity,
    ticks: TickGenerator,
    knowledge: RwLock<Knowledge>,
    forgotten: RwLock<ForgottenKnowledge>,
    gate: Arc<WriterGate>,
}

impl MetadataManager {
    /// Opens the sync state of the store behind `host`, creating it if absent.
    pub fn open(host: Arc<dyn SessionHost>, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let txn = host.begin()?;
        let state = match Self::load_state(txn.as_store()) {
            Ok(state) => state,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };
        txn.commit()?;

        info!(
            replica = %state.replica,
            types = state.registry.len(),
            exceptions = state.knowledge.exception_count(),
            "sync metadata opened"
        );
        Ok(Self {
            host,
            registry: Arc::new(state.registry),
            config,
            ticks: TickGenerator::new(&state.replica),
            replica: state.replica,
            knowledge: RwLock::new(state.knowledge),
            forgotten: RwLock::new(state.forgotten),
            gate: Arc::new(WriterGate::new()),
        })
    }

    fn load_state(store: &dyn SyncStore) -> Result<PersistedState, SyncError> {
        let registry = TypeRegistry::build(store.schema())?;

        let replica = match store.get(REPLICA_ID_KEY)? {
            Some(raw) => ReplicaIdentity::from_slice(&raw)?,
            None => {
                let replica = ReplicaIdentity::generate();
                store.put(REPLICA_ID_KEY.to_vec(), replica.as_bytes().to_vec())?;
                debug!(replica = %replica, "replica identity created");
                replica
            }
        };

        let knowledge = match store.get(KNOWLEDGE_KEY)? {
            Some(raw) => Knowledge::from_bytes(&raw)?,
            None => {
                let knowledge = Knowledge::new(replica);
                store.put(KNOWLEDGE_KEY.to_vec(), knowledge.to_bytes()?)?;
                knowledge
            }
        };
        if knowledge.owner() != replica {
            return Err(SyncError::Format(format!(
                "stored knowledge belongs to {}, not {}",
                knowledge.owner(),
                replica
            )));
        }

        let forgotten = match store.get(FORGOTTEN_KNOWLEDGE_KEY)? {
            Some(raw) => ForgottenKnowledge::from_bytes(&raw)?,
            None => {
                let forgotten = ForgottenKnowledge::new(replica);
                store.put(FORGOTTEN_KNOWLEDGE_KEY.to_vec(), forgotten.to_bytes()?)?;
                forgotten
            }
        };

        Ok(PersistedState {
            registry,
            replica,
            knowledge,
            forgotten,
        })
    }

    /// This replica's identity.
    pub fn replica(&self) -> ReplicaIdentity {
        self.replica
    }

    /// Types in key-dependency order.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts a store transaction.
    pub fn begin(&self) -> Result<Box<dyn StoreTransaction>, SyncError> {
        Ok(self.host.begin()?)
    }

    /// Commits a transaction and drops the cached tick.
    pub fn commit(&self, txn: Box<dyn StoreTransaction>) -> Result<(), SyncError> {
        let result = txn.commit();
        self.ticks.invalidate();
        Ok(result?)
    }

    /// Rolls a transaction back and drops the cached tick.
    pub fn rollback(&self, txn: Box<dyn StoreTransaction>) {
        txn.rollback();
        self.ticks.invalidate();
    }

    /// Metadata access through `store`.
    pub fn metadata_store<'a>(&self, store: &'a dyn SyncStore) -> MetadataStore<'a> {
        MetadataStore::new(store, self.config.lookup_batch_size)
    }

    /// Persisted knowledge, raised to the last tick issued here.
    pub fn current_knowledge(&self, store: &dyn SyncStore) -> Result<Knowledge, SyncError> {
        let mut knowledge = self
            .knowledge
            .read()
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
            .clone();
        knowledge.set_local_tick(self.ticks.last_tick(store)?);
        Ok(knowledge)
    }

    /// Knowledge dropped by compaction so far.
    pub fn forgotten_knowledge(&self) -> Result<ForgottenKnowledge, SyncError> {
        Ok(self
            .forgotten
            .read()
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
            .clone())
    }

    /// Replica and tick behind a version in the persisted key space.
    pub fn resolve_version(
        &self,
        version: &Version,
    ) -> Result<Option<(ReplicaIdentity, u64)>, SyncError> {
        Ok(self
            .knowledge
            .read()
            .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
            .resolve_version(version))
    }

    /// Reserves the next local tick.
    pub fn next_tick(&self, store: &dyn SyncStore) -> Result<u64, SyncError> {
        self.ticks.next_tick(store)
    }

    /// Records a locally created entity.
    pub fn create_metadata(
        &self,
        store: &dyn SyncStore,
        type_name: &TypeName,
        key: &EntityKey,
    ) -> Result<SyncMetadata, SyncError> {
        let schema = self.registry.by_name(type_name)?;
        let tick = self.next_tick(store)?;
        self.metadata_store(store)
            .create_metadata(schema.type_tag, key.clone(), &self.replica, tick)
    }

    /// Records a local update. Entities without metadata are treated as new.
    pub fn update_metadata(
        &self,
        store: &dyn SyncStore,
        type_name: &TypeName,
        key: &EntityKey,
    ) -> Result<SyncMetadata, SyncError> {
        let schema = self.registry.by_name(type_name)?;
        let metadata = self.metadata_store(store);
        match metadata.metadata_by_key(schema.type_tag, key)? {
            Some(mut meta) => {
                let tick = self.next_tick(store)?;
                meta.change_version = Version::local(tick);
                metadata.update(&meta)?;
                Ok(meta)
            }
            None => self.create_metadata(store, type_name, key),
        }
    }

    /// Records a local delete. Returns `None` if the entity had no metadata.
    pub fn delete_metadata(
        &self,
        store: &dyn SyncStore,
        type_name: &TypeName,
        key: &EntityKey,
    ) -> Result<Option<SyncMetadata>, SyncError> {
        let schema = self.registry.by_name(type_name)?;
        let metadata = self.metadata_store(store);
        match metadata.metadata_by_key(schema.type_tag, key)? {
            Some(mut meta) => {
                let tick = self.next_tick(store)?;
                metadata.tombstone(&mut meta, Version::local(tick))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Turns change notifications into metadata updates.
    pub fn record_changes(
        &self,
        store: &dyn SyncStore,
        notifications: &[ChangeNotification],
    ) -> Result<usize, SyncError> {
        for note in notifications {
            match note.kind {
                NotificationKind::Created | NotificationKind::Modified => {
                    self.update_metadata(store, &note.type_name, &note.key)?;
                }
                NotificationKind::Removed => {
                    self.delete_metadata(store, &note.type_name, &note.key)?;
                }
            }
        }
        Ok(notifications.len())
    }

    /// Blocks change log drains until the guard is dropped. Destination
    /// sessions hold it so local metadata cannot change under their
    /// transaction.
    pub(crate) fn lock_for_apply(&self) -> Result<WriterGuard, SyncError> {
        self.gate.acquire(Writer::Applying)
    }

    /// Processes up to `limit` change log entries in their own transaction.
    ///
    /// Waits while a destination session is open.
    pub fn drain_change_log(&self, limit: usize) -> Result<usize, SyncError> {
        let _guard = self.gate.acquire(Writer::Draining)?;
        let txn = self.begin()?;
        match self.drain_into(txn.as_store(), limit) {
            Ok(count) => {
                self.commit(txn)?;
                if count > 0 {
                    debug!(count, "change log drained");
                }
                Ok(count)
            }
            Err(e) => {
                self.rollback(txn);
                Err(e)
            }
        }
    }

    fn drain_into(&self, store: &dyn SyncStore, limit: usize) -> Result<usize, SyncError> {
        let pending = ChangeLog::pending(store, limit)?;
        let Some(&(through, _)) = pending.last() else {
            return Ok(0);
        };
        let notes: Vec<ChangeNotification> = pending.into_iter().map(|(_, note)| note).collect();
        self.record_changes(store, &notes)?;
        ChangeLog::acknowledge(store, through)?;
        Ok(notes.len())
    }

    /// Drains the change log until it is empty.
    pub fn catch_up(&self) -> Result<usize, SyncError> {
        let batch = self.config.maintenance_batch_size;
        let mut total = 0;
        loop {
            let drained = self.drain_change_log(batch)?;
            total += drained;
            if drained < batch {
                return Ok(total);
            }
        }
    }

    /// Local view of each descriptor: the local versions, or
    /// [`ChangeKind::UnknownItem`].
    pub fn get_local_version_for(
        &self,
        store: &dyn SyncStore,
        remote: &[ChangeDescriptor],
    ) -> Result<Vec<ChangeDescriptor>, SyncError> {
        let metadata = self.metadata_store(store);
        remote
            .iter()
            .map(|descriptor| {
                Ok(match metadata.metadata_by_id(&descriptor.global_id)? {
                    Some(meta) => ChangeDescriptor {
                        global_id: meta.global_id,
                        kind: if meta.is_tombstone {
                            ChangeKind::Delete
                        } else {
                            ChangeKind::Update
                        },
                        creation_version: meta.creation_version,
                        change_version: meta.relevant_version(),
                    },
                    None => ChangeDescriptor::unknown(descriptor.global_id),
                })
            })
            .collect()
    }

    /// Merges a session's knowledge into the persisted one, compacts it,
    /// writes both blobs through `txn` and commits.
    ///
    /// The rows in `txn` carry versions keyed by the merged key map, so the
    /// two become durable together. The in-memory copy is replaced only
    /// after the commit succeeded.
    pub fn commit_with_knowledge(
        &self,
        txn: Box<dyn StoreTransaction>,
        working: &Knowledge,
    ) -> Result<(), SyncError> {
        let mut knowledge = match self.knowledge.write() {
            Ok(knowledge) => knowledge,
            Err(e) => {
                let err = SyncError::LockPoisoned(e.to_string());
                self.rollback(txn);
                return Err(err);
            }
        };
        let mut forgotten = match self.forgotten.write() {
            Ok(forgotten) => forgotten,
            Err(e) => {
                let err = SyncError::LockPoisoned(e.to_string());
                self.rollback(txn);
                return Err(err);
            }
        };

        let staged = stage_knowledge(
            txn.as_store(),
            &knowledge,
            &forgotten,
            working,
            self.config.max_knowledge_exceptions,
        );
        let (merged, next_forgotten, dropped) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.rollback(txn);
                return Err(e);
            }
        };
        self.commit(txn)?;

        debug!(
            exceptions = merged.exception_count(),
            dropped,
            "knowledge persisted"
        );
        *knowledge = merged;
        *forgotten = next_forgotten;
        Ok(())
    }
}

fn stage_knowledge(
    store: &dyn SyncStore,
    knowledge: &Knowledge,
    forgotten: &ForgottenKnowledge,
    working: &Knowledge,
    max_exceptions: usize,
) -> Result<(Knowledge, ForgottenKnowledge, usize), SyncError> {
    let mut merged = knowledge.clone();
    merged.combine(working)?;
    let mut next_forgotten = forgotten.clone();
    let dropped = merged.compact_into(&mut next_forgotten, max_exceptions)?;
    let forgotten_changed = if dropped > 0 { Some(&next_forgotten) } else { None };
    write_knowledge(store, &merged, forgotten_changed)?;
    Ok((merged, next_forgotten, dropped))
}

fn write_knowledge(
    store: &dyn SyncStore,
    knowledge: &Knowledge,
    forgotten: Option<&ForgottenKnowledge>,
) -> Result<(), SyncError> {
    store.put(KNOWLEDGE_KEY.to_vec(), knowledge.to_bytes()?)?;
    if let Some(forgotten) = forgotten {
        store.put(FORGOTTEN_KNOWLEDGE_KEY.to_vec(), forgotten.to_bytes()?)?;
    }
    Ok(())
}
