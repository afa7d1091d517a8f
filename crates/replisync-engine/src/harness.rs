//! One-way synchronization between two in-process replicas.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::applier::{ApplyStats, ConflictPolicy, SyncCallbacks};
use crate::detector::SyncScope;
use crate::error::SyncError;
use crate::provider::{SessionRole, SyncProvider};

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Source replica id.
    pub source: String,
    /// Destination replica id.
    pub destination: String,
    /// Batches transferred.
    pub batches: usize,
    /// Descriptors transferred.
    pub changes: usize,
    /// Destination counters.
    pub stats: ApplyStats,
}

/// Pushes everything `destination` lacks from `source`.
///
/// Both sessions are aborted if any step fails, leaving both replicas as
/// they were.
pub fn sync_once(
    source: &mut SyncProvider,
    destination: &mut SyncProvider,
    policy: ConflictPolicy,
    scope: SyncScope,
    callbacks: &mut dyn SyncCallbacks,
) -> Result<SyncReport, SyncError> {
    source.begin_session(SessionRole::Source(scope))?;
    if let Err(e) = destination.begin_session(SessionRole::Destination) {
        source.abort_session();
        return Err(e);
    }

    let mut report = match transfer(source, destination, policy, callbacks) {
        Ok(report) => report,
        Err(e) => {
            source.abort_session();
            destination.abort_session();
            return Err(e);
        }
    };

    report.stats = match destination.end_session() {
        Ok(stats) => stats,
        Err(e) => {
            source.abort_session();
            return Err(e);
        }
    };
    source.end_session()?;

    info!(
        source = %report.source,
        destination = %report.destination,
        batches = report.batches,
        changes = report.changes,
        "sync pass complete"
    );
    Ok(report)
}

fn transfer(
    source: &mut SyncProvider,
    destination: &mut SyncProvider,
    policy: ConflictPolicy,
    callbacks: &mut dyn SyncCallbacks,
) -> Result<SyncReport, SyncError> {
    let (batch_size, knowledge) = destination.get_batching_parameters()?;
    let mut report = SyncReport {
        source: source.manager().replica().to_string(),
        destination: destination.manager().replica().to_string(),
        ..SyncReport::default()
    };

    loop {
        let (batch, data) = source.get_change_batch(batch_size, &knowledge)?;
        report.batches += 1;
        report.changes += batch.len();
        destination.apply_change_batch(policy, &batch, &data, callbacks)?;
        if batch.is_last_batch {
            return Ok(report);
        }
    }
}
