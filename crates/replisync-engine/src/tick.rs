//! Logical clock of one replica.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use replisync_store::SyncStore;

use crate::error::SyncError;
use crate::id::ReplicaIdentity;

/// Issues strictly increasing ticks through the store's atomic sequence.
///
/// The last issued tick is cached until the next commit or rollback
/// boundary calls [`TickGenerator::invalidate`].
#[derive(Debug)]
pub struct TickGenerator {
    scope: String,
    cached: AtomicU64,
    cache_valid: AtomicBool,
}

impl TickGenerator {
    /// Creates a generator scoped to one replica.
    pub fn new(replica: &ReplicaIdentity) -> Self {
        Self {
            scope: replica.to_string(),
            cached: AtomicU64::new(0),
            cache_valid: AtomicBool::new(false),
        }
    }

    /// Reserves and returns the next tick.
    pub fn next_tick(&self, store: &dyn SyncStore) -> Result<u64, SyncError> {
        let tick = to_tick(store.generate_tick(&self.scope)?)?;
        self.cached.fetch_max(tick, Ordering::SeqCst);
        self.cache_valid.store(true, Ordering::SeqCst);
        Ok(tick)
    }

    /// Last issued tick, 0 if none.
    pub fn last_tick(&self, store: &dyn SyncStore) -> Result<u64, SyncError> {
        if self.cache_valid.load(Ordering::SeqCst) {
            return Ok(self.cached.load(Ordering::SeqCst));
        }
        let tick = to_tick(store.last_generated_tick(&self.scope)?)?;
        self.cached.store(tick, Ordering::SeqCst);
        self.cache_valid.store(true, Ordering::SeqCst);
        Ok(tick)
    }

    /// Drops the cached value.
    pub fn invalidate(&self) {
        self.cache_valid.store(false, Ordering::SeqCst);
    }
}

fn to_tick(raw: i64) -> Result<u64, SyncError> {
    u64::try_from(raw).map_err(|_| SyncError::Format(format!("negative tick {raw}")))
}
