//! Session lifecycle of one replica.
//!
//! A session owns a single store transaction. Source sessions only read and
//! are rolled back when they end; destination sessions commit their writes
//! together with the knowledge they learned, and keep change log drains out
//! until then. Any failed call aborts the session and rolls everything back.

use std::sync::Arc;

use tracing::{debug, info, warn};

use replisync_store::{StoreTransaction, SyncStore};

use crate::applier::{ApplyStats, ChangeApplier, ConflictPolicy, SyncCallbacks};
use crate::batch::{BatchBuilder, ChangeBatch};
use crate::change::{ChangeDataRetriever, ChangeDataSource, ChangeDescriptor};
use crate::detector::{ChangeDetector, DetectedChanges, SyncScope};
use crate::error::SyncError;
use crate::knowledge::{ForgottenKnowledge, Knowledge};
use crate::manager::{MetadataManager, WriterGuard};

/// Part a replica plays in a session.
#[derive(Debug, Clone)]
pub enum SessionRole {
    /// Enumerates changes within a scope.
    Source(SyncScope),
    /// Applies incoming batches.
    Destination,
}

struct SourceSession {
    knowledge: Knowledge,
    forgotten: ForgottenKnowledge,
    detector: ChangeDetector,
    builder: BatchBuilder,
    lookahead: Option<DetectedChanges>,
    exhausted: bool,
    warned_forgotten: bool,
}

enum SessionState {
    Source(Box<SourceSession>),
    Destination(ChangeApplier),
}

struct ActiveSession {
    txn: Box<dyn StoreTransaction>,
    state: SessionState,
    // Declared last: released after the transaction is gone.
    _writer: Option<WriterGuard>,
}

fn no_session() -> SyncError {
    SyncError::Session("no active session".to_string())
}

/// Sync endpoint of one replica.
pub struct SyncProvider {
    manager: Arc<MetadataManager>,
    session: Option<ActiveSession>,
}

impl SyncProvider {
    /// Wraps a replica's metadata manager.
    pub fn new(manager: Arc<MetadataManager>) -> Self {
        Self {
            manager,
            session: None,
        }
    }

    /// The underlying manager.
    pub fn manager(&self) -> &Arc<MetadataManager> {
        &self.manager
    }

    /// True while a session is open.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Opens a session after bringing metadata up to date with the change
    /// log, so local edits are both offered and detected as conflicts.
    pub fn begin_session(&mut self, role: SessionRole) -> Result<(), SyncError> {
        if self.session.is_some() {
            return Err(SyncError::Session("a session is already active".to_string()));
        }
        self.manager.catch_up()?;
        let writer = match role {
            SessionRole::Destination => Some(self.manager.lock_for_apply()?),
            SessionRole::Source(_) => None,
        };

        let txn = self.manager.begin()?;
        let state = match self.prepare(txn.as_store(), role) {
            Ok(state) => state,
            Err(e) => {
                self.manager.rollback(txn);
                return Err(e);
            }
        };
        info!(
            replica = %self.manager.replica(),
            role = match state {
                SessionState::Source(_) => "source",
                SessionState::Destination(_) => "destination",
            },
            "sync session started"
        );
        self.session = Some(ActiveSession {
            txn,
            state,
            _writer: writer,
        });
        Ok(())
    }

    fn prepare(&self, store: &dyn SyncStore, role: SessionRole) -> Result<SessionState, SyncError> {
        let knowledge = self.manager.current_knowledge(store)?;
        let registry = Arc::clone(self.manager.registry());
        let lookup = self.manager.config().lookup_batch_size;
        Ok(match role {
            SessionRole::Source(scope) => {
                let full_scope = scope.is_full(&registry);
                SessionState::Source(Box::new(SourceSession {
                    builder: BatchBuilder::new(knowledge.clone(), full_scope),
                    detector: ChangeDetector::new(registry, scope, lookup),
                    forgotten: self.manager.forgotten_knowledge()?,
                    knowledge,
                    lookahead: None,
                    exhausted: false,
                    warned_forgotten: false,
                }))
            }
            SessionRole::Destination => SessionState::Destination(ChangeApplier::new(registry, knowledge, lookup)),
        })
    }

    /// Batch size from the configuration and the knowledge a peer should be
    /// offered: the session's view when one is open, the persisted one otherwise.
    pub fn get_batching_parameters(&self) -> Result<(usize, Knowledge), SyncError> {
        let batch_size = self.manager.config().batch_size;
        let knowledge = match &self.session {
            Some(ActiveSession {
                state: SessionState::Source(source),
                ..
            }) => source.knowledge.clone(),
            Some(ActiveSession {
                state: SessionState::Destination(applier),
                ..
            }) => applier.knowledge().clone(),
            None => {
                let txn = self.manager.begin()?;
                let knowledge = self.manager.current_knowledge(txn.as_store());
                self.manager.rollback(txn);
                knowledge?
            }
        };
        Ok((batch_size, knowledge))
    }

    /// Next batch of changes `destination` lacks, with their payloads.
    ///
    /// The final batch has `is_last_batch` set; calling again afterwards
    /// returns further empty final batches.
    pub fn get_change_batch(
        &mut self,
        max_items: usize,
        destination: &Knowledge,
    ) -> Result<(ChangeBatch, ChangeDataRetriever), SyncError> {
        let result = self.next_batch(max_items, destination);
        if result.is_err() {
            self.abort_session();
        }
        result
    }

    fn next_batch(
        &mut self,
        max_items: usize,
        destination: &Knowledge,
    ) -> Result<(ChangeBatch, ChangeDataRetriever), SyncError> {
        let ActiveSession { txn, state, .. } = self.session.as_mut().ok_or_else(no_session)?;
        let SessionState::Source(source) = state else {
            return Err(SyncError::Session(
                "destination session cannot produce batches".to_string(),
            ));
        };
        let store = txn.as_store();
        let mapped = source.knowledge.map_remote_to_local(destination)?;

        if !source.warned_forgotten
            && !source.forgotten.is_empty()
            && !mapped.covers(source.forgotten.knowledge())
        {
            warn!("destination knowledge predates compacted source knowledge, items may be resent");
            source.warned_forgotten = true;
        }

        let current = match source.lookahead.take() {
            Some(changes) => Some(changes),
            None if source.exhausted => None,
            None => source.detector.next_changes(store, &mapped, max_items)?,
        };
        let lookahead = match current {
            Some(_) => source.detector.next_changes(store, &mapped, max_items)?,
            None => None,
        };
        let is_last = lookahead.is_none();
        source.exhausted = is_last;
        source.lookahead = lookahead;

        let (batch, retriever) = source.builder.build(current, is_last)?;
        debug!(
            sequence = batch.sequence,
            changes = batch.len(),
            last = batch.is_last_batch,
            "change batch built"
        );
        Ok((batch, retriever))
    }

    /// Applies a batch produced by a peer's source session.
    pub fn apply_change_batch(
        &mut self,
        policy: ConflictPolicy,
        batch: &ChangeBatch,
        data: &dyn ChangeDataSource,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<(), SyncError> {
        let result = self.apply_inner(policy, batch, data, callbacks);
        if result.is_err() {
            self.abort_session();
        }
        result
    }

    fn apply_inner(
        &mut self,
        policy: ConflictPolicy,
        batch: &ChangeBatch,
        data: &dyn ChangeDataSource,
        callbacks: &mut dyn SyncCallbacks,
    ) -> Result<(), SyncError> {
        let ActiveSession { txn, state, .. } = self.session.as_mut().ok_or_else(no_session)?;
        let SessionState::Destination(applier) = state else {
            return Err(SyncError::Session(
                "source session cannot apply batches".to_string(),
            ));
        };
        applier.apply_batch(txn.as_store(), policy, batch, data, callbacks)
    }

    /// Local versions of the given items, see
    /// [`MetadataManager::get_local_version_for`].
    pub fn get_local_version_for(&self, remote: &[ChangeDescriptor]) -> Result<Vec<ChangeDescriptor>, SyncError> {
        match &self.session {
            Some(session) => self
                .manager
                .get_local_version_for(session.txn.as_store(), remote),
            None => {
                let txn = self.manager.begin()?;
                let result = self.manager.get_local_version_for(txn.as_store(), remote);
                self.manager.rollback(txn);
                result
            }
        }
    }

    /// Closes the session. Destinations commit their rows and what they
    /// learned in one transaction; sources discard their read transaction.
    pub fn end_session(&mut self) -> Result<ApplyStats, SyncError> {
        let session = self.session.take().ok_or_else(no_session)?;
        match session.state {
            SessionState::Source(_) => {
                self.manager.rollback(session.txn);
                info!(replica = %self.manager.replica(), "source session ended");
                Ok(ApplyStats::default())
            }
            SessionState::Destination(applier) => {
                let policy = self.manager.config().unresolved_references;
                let (knowledge, stats) = match applier.finish(policy) {
                    Ok(done) => done,
                    Err(e) => {
                        self.manager.rollback(session.txn);
                        return Err(e);
                    }
                };
                self.manager.commit_with_knowledge(session.txn, &knowledge)?;
                info!(
                    replica = %self.manager.replica(),
                    created = stats.created,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    conflicts = stats.conflicts,
                    "destination session committed"
                );
                Ok(stats)
            }
        }
    }

    /// Rolls back the open session, if any.
    pub fn abort_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.manager.rollback(session.txn);
            warn!(replica = %self.manager.replica(), "sync session aborted");
        }
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.abort_session();
    }
}
