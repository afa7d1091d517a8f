//! Change batches and the knowledge they carry.

use serde::{Deserialize, Serialize};

use crate::change::{ChangeDataRetriever, ChangeDescriptor};
use crate::detector::DetectedChanges;
use crate::error::SyncError;
use crate::id::{GlobalId, ReplicaIdentity};
use crate::knowledge::Knowledge;

/// How the descriptors of a batch relate to the id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchGroup {
    /// Every unknown change with an id in `[lower, upper]` is in the batch.
    Ordered {
        /// Inclusive lower bound.
        lower: GlobalId,
        /// Inclusive upper bound.
        upper: GlobalId,
    },
    /// An arbitrary set of items.
    Unordered,
}

/// One unit of transfer from a source to a destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Replica that produced the batch.
    pub source: ReplicaIdentity,
    /// Position in the session, starting at 0.
    pub sequence: u32,
    /// Range or unordered grouping.
    pub group: BatchGroup,
    /// Descriptors, in the source's key space.
    pub changes: Vec<ChangeDescriptor>,
    /// What the destination may claim to know once the batch is applied.
    pub learned_knowledge: Knowledge,
    /// Source knowledge at enumeration time; resolves the versions above.
    pub made_with_knowledge: Knowledge,
    /// True for the final batch of the session.
    pub is_last_batch: bool,
}

impl ChangeBatch {
    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True for a batch without descriptors.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Turns detected groups into batches with their learned knowledge.
#[derive(Debug)]
pub struct BatchBuilder {
    knowledge: Knowledge,
    full_scope: bool,
    next_sequence: u32,
}

impl BatchBuilder {
    /// `knowledge` is the source's snapshot for the whole session.
    pub fn new(knowledge: Knowledge, full_scope: bool) -> Self {
        Self {
            knowledge,
            full_scope,
            next_sequence: 0,
        }
    }

    /// Builds the next batch from a detected group, or an empty closing
    /// batch when `detected` is `None`.
    pub fn build(
        &mut self,
        detected: Option<DetectedChanges>,
        is_last: bool,
    ) -> Result<(ChangeBatch, ChangeDataRetriever), SyncError> {
        let (group, items) = match detected {
            Some(d) => (d.group, d.items),
            None => (BatchGroup::Unordered, Vec::new()),
        };

        let mut learned = match group {
            BatchGroup::Ordered { lower, upper } => self.knowledge.project_range(lower, upper),
            BatchGroup::Unordered => self.knowledge.empty_like(),
        };
        let mut retriever = ChangeDataRetriever::new();
        let mut changes = Vec::with_capacity(items.len());
        for data in items {
            if group == BatchGroup::Unordered {
                learned.combine(&self.knowledge.project_item(&data.descriptor.global_id))?;
            }
            changes.push(data.descriptor.clone());
            retriever.insert(data);
        }
        if is_last && self.full_scope {
            learned = self.knowledge.clone();
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let batch = ChangeBatch {
            source: self.knowledge.owner(),
            sequence,
            group,
            changes,
            learned_knowledge: learned,
            made_with_knowledge: self.knowledge.clone(),
            is_last_batch: is_last,
        };
        Ok((batch, retriever))
    }
}
