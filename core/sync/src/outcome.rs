//! Push handler outcomes and drain results.

use crate::metrics::SyncSessionMetrics;

/// Result of pushing one pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Server accepted the change; remove the operation.
    Success,
    /// A dependency has no server id yet; back off. Carries a hint naming it.
    Skip(String),
    /// Leave the operation untouched for the next drain.
    Retry,
    /// Permanently inapplicable; remove the operation.
    Drop(String),
    /// Stale lock token; park as CONFLICT with the reason.
    ConflictPending(String),
}

impl OperationOutcome {
    pub fn skip(hint: impl Into<String>) -> Self {
        OperationOutcome::Skip(hint.into())
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        OperationOutcome::Drop(reason.into())
    }
}

/// A project that received its server id during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedProject {
    pub local_project_id: i64,
    pub server_project_id: i64,
}

/// Summary of one call to `process_pending_operations`.
#[derive(Debug, Clone, Default)]
pub struct PendingOperationResult {
    pub created_projects: Vec<CreatedProject>,
    pub metrics: SyncSessionMetrics,
    /// The drain was skipped because the network was unavailable.
    pub skipped_offline: bool,
}
