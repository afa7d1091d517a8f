//! Background drain of the change log into sync metadata.
//!
//! Writers append to the change log and call
//! [`MaintenanceHandle::notify_data_available`]. The worker wakes up, flips
//! the signal back to idle and drains the log in chunks of
//! `maintenance_batch_size`, each chunk in its own transaction. A notify
//! that arrives mid-drain schedules one more cycle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::manager::MetadataManager;

/// Worker state shared with the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceSignal {
    /// Nothing to do.
    Idle,
    /// The change log has new entries.
    DataAvailable,
    /// The worker must stop.
    Aborted,
}

/// Counters published after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceStats {
    /// Completed drain cycles.
    pub cycles: u64,
    /// Change log entries turned into metadata.
    pub notifications_processed: u64,
    /// Cycles that failed.
    pub errors: u64,
}

/// Handle to a running maintenance worker.
pub struct MaintenanceHandle {
    signal: Arc<watch::Sender<MaintenanceSignal>>,
    stats: watch::Receiver<MaintenanceStats>,
    task: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Wakes the worker unless it is already scheduled or stopping.
    pub fn notify_data_available(&self) {
        self.signal.send_if_modified(|signal| {
            if *signal == MaintenanceSignal::Idle {
                *signal = MaintenanceSignal::DataAvailable;
                true
            } else {
                false
            }
        });
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MaintenanceStats {
        self.stats.borrow().clone()
    }

    /// Receiver that observes every published counter update.
    pub fn subscribe_stats(&self) -> watch::Receiver<MaintenanceStats> {
        self.stats.clone()
    }

    /// True until the worker task exits.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Stops the worker after its current chunk and waits for it.
    pub async fn shutdown(mut self) -> Result<MaintenanceStats, SyncError> {
        self.signal.send_replace(MaintenanceSignal::Aborted);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SyncError::Session(format!("maintenance task failed: {}", e)))?;
        }
        Ok(self.stats())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.signal.send_replace(MaintenanceSignal::Aborted);
    }
}

/// Drains the change log of one replica whenever it is signalled.
pub struct MaintenanceWorker {
    manager: Arc<MetadataManager>,
    signal: Arc<watch::Sender<MaintenanceSignal>>,
    stats_tx: watch::Sender<MaintenanceStats>,
    stats: MaintenanceStats,
}

impl MaintenanceWorker {
    /// Spawns the worker on the current tokio runtime. The first cycle runs
    /// immediately to pick up entries logged before startup.
    pub fn start(manager: Arc<MetadataManager>) -> MaintenanceHandle {
        let (signal_tx, _) = watch::channel(MaintenanceSignal::DataAvailable);
        let signal = Arc::new(signal_tx);
        let (stats_tx, stats_rx) = watch::channel(MaintenanceStats::default());

        let worker = MaintenanceWorker {
            manager,
            signal: Arc::clone(&signal),
            stats_tx,
            stats: MaintenanceStats::default(),
        };
        let task = tokio::spawn(worker.run());

        MaintenanceHandle {
            signal,
            stats: stats_rx,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        let mut signal_rx = self.signal.subscribe();
        loop {
            let signal = match signal_rx
                .wait_for(|s| *s != MaintenanceSignal::Idle)
                .await
            {
                Ok(signal) => *signal,
                Err(_) => break,
            };
            if signal == MaintenanceSignal::Aborted {
                break;
            }
            self.signal.send_if_modified(|s| {
                if *s == MaintenanceSignal::DataAvailable {
                    *s = MaintenanceSignal::Idle;
                    true
                } else {
                    false
                }
            });
            self.cycle().await;
        }
        debug!(replica = %self.manager.replica(), "maintenance worker stopped");
    }

    async fn cycle(&mut self) {
        let manager = Arc::clone(&self.manager);
        let signal = Arc::clone(&self.signal);
        let drained = tokio::task::spawn_blocking(move || -> Result<u64, SyncError> {
            let chunk = manager.config().maintenance_batch_size;
            let mut total = 0u64;
            loop {
                if *signal.borrow() == MaintenanceSignal::Aborted {
                    return Ok(total);
                }
                let count = manager.drain_change_log(chunk)?;
                total += count as u64;
                if count < chunk {
                    return Ok(total);
                }
            }
        })
        .await;

        match drained {
            Ok(Ok(count)) => {
                self.stats.cycles += 1;
                self.stats.notifications_processed += count;
                info!(
                    replica = %self.manager.replica(),
                    processed = count,
                    "maintenance cycle complete"
                );
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                warn!(error = %e, "maintenance cycle failed");
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!(error = %e, "maintenance task panicked");
            }
        }
        let _ = self.stats_tx.send(self.stats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use replisync_store::{
        ChangeLog, ChangeNotification, EntitySchema, EntityStore, MemoryStore, Schema, TypeName,
    };

    fn setup() -> (Arc<MemoryStore>, Arc<MetadataManager>) {
        let store = Arc::new(MemoryStore::new(
            Schema::new(vec![EntitySchema::generated("Author", 1)]).unwrap(),
        ));
        let config = SyncConfig {
            maintenance_batch_size: 2,
            ..SyncConfig::default()
        };
        let manager = Arc::new(MetadataManager::open(store.clone(), config).unwrap());
        (store, manager)
    }

    #[tokio::test]
    async fn test_worker_drains_on_notify() {
        let (store, manager) = setup();
        let handle = MaintenanceWorker::start(manager.clone());
        let mut stats = handle.subscribe_stats();
        stats.wait_for(|s| s.cycles >= 1).await.unwrap();

        let author = TypeName::from("Author");
        let mut notes = Vec::new();
        for _ in 0..5 {
            let key = store.create_entity(&author, None).unwrap();
            notes.push(ChangeNotification::created(author.clone(), key));
        }
        ChangeLog::append(store.as_ref(), &notes).unwrap();
        handle.notify_data_available();

        stats
            .wait_for(|s| s.notifications_processed >= 5)
            .await
            .unwrap();
        assert_eq!(ChangeLog::len(store.as_ref()).unwrap(), 0);
        assert_eq!(manager.metadata_store(store.as_ref()).count(1).unwrap(), 5);
        assert!(handle.is_running());

        let final_stats = handle.shutdown().await.unwrap();
        assert_eq!(final_stats.errors, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_store, manager) = setup();
        let handle = MaintenanceWorker::start(manager);
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.errors, 0);
    }
}
