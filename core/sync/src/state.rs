//! Queue state snapshots for status reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fieldsync_common::{EntityKind, Error, Result};
use fieldsync_storage::{LocalStore, OperationStatus, PendingOperation};

/// Operation counts for one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub pending: usize,
    pub failed: usize,
    pub conflict: usize,
}

impl KindCounts {
    pub fn total(&self) -> usize {
        self.pending + self.failed + self.conflict
    }
}

/// Point-in-time view of the pending-operation queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub by_kind: BTreeMap<EntityKind, KindCounts>,
    /// Pending operations whose backoff has not expired.
    pub scheduled: usize,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub open_conflicts: usize,
}

impl QueueSummary {
    /// Summarize a set of operations as of `now`.
    pub fn from_operations(operations: &[PendingOperation], now: DateTime<Utc>) -> Self {
        let mut summary = Self::default();
        for op in operations {
            let counts = summary.by_kind.entry(op.entity_type).or_default();
            match op.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Failed => counts.failed += 1,
                OperationStatus::Conflict => counts.conflict += 1,
            }
            if op.status == OperationStatus::Pending && !op.is_due(now) {
                summary.scheduled += 1;
                summary.next_scheduled_at = match (summary.next_scheduled_at, op.scheduled_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        summary
    }

    /// Summarize a store's queue and conflicts.
    pub async fn collect(store: &dyn LocalStore) -> Result<Self> {
        let operations = store.operations().await?;
        let mut summary = Self::from_operations(&operations, Utc::now());
        summary.open_conflicts = store.open_conflicts().await?.len();
        Ok(summary)
    }

    pub fn count(&self, status: OperationStatus) -> usize {
        self.by_kind
            .values()
            .map(|c| match status {
                OperationStatus::Pending => c.pending,
                OperationStatus::Failed => c.failed,
                OperationStatus::Conflict => c.conflict,
            })
            .sum()
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().map(KindCounts::total).sum()
    }

    /// Whether anything is still waiting to be pushed.
    pub fn has_pending_work(&self) -> bool {
        self.count(OperationStatus::Pending) > 0
    }

    /// Whether anything needs a user or a retry sweep.
    pub fn needs_attention(&self) -> bool {
        self.count(OperationStatus::Failed) > 0
            || self.count(OperationStatus::Conflict) > 0
            || self.open_conflicts > 0
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
