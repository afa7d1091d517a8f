//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::applier::ConflictPolicy;
use crate::error::SyncError;

/// What to do with references still unresolved when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReferencePolicy {
    /// Leave the fields null, log and count them.
    #[default]
    LeaveNull,
    /// Abort the session.
    Fail,
}

/// Tunables for one replica's sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum descriptors per change batch.
    pub batch_size: usize,
    /// Keys per metadata lookup round.
    pub lookup_batch_size: usize,
    /// Change log entries drained per maintenance cycle.
    pub maintenance_batch_size: usize,
    /// Exceptions kept in knowledge before compaction.
    pub max_knowledge_exceptions: usize,
    /// Policy for references pending at session end.
    pub unresolved_references: UnresolvedReferencePolicy,
    /// Conflict policy used when the caller does not pick one.
    pub default_conflict_policy: ConflictPolicy,
    /// Types to send as a source; all types when unset.
    pub included_types: Option<Vec<String>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lookup_batch_size: 64,
            maintenance_batch_size: 256,
            max_knowledge_exceptions: 1024,
            unresolved_references: UnresolvedReferencePolicy::LeaveNull,
            default_conflict_policy: ConflictPolicy::SourceWins,
            included_types: None,
        }
    }
}

impl SyncConfig {
    /// Loads a TOML or JSON file, chosen by extension, and validates it.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SyncError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| SyncError::Config(e.to_string()))?
            }
            _ => {
                return Err(SyncError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero sizes.
    pub fn validate(&self) -> Result<(), SyncError> {
        let sizes = [
            ("batch_size", self.batch_size),
            ("lookup_batch_size", self.lookup_batch_size),
            ("maintenance_batch_size", self.maintenance_batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}
