//! Local data store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityKind, Result};

use crate::model::Record;
use crate::queue::PendingOperation;

/// A stale-lock rejection kept for the user to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub operation_id: String,
    pub entity_type: EntityKind,
    pub entity_id: i64,
    pub entity_uuid: String,
    pub local_version: serde_json::Value,
    pub remote_version: serde_json::Value,
    pub conflict_type: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Keyed CRUD over local entities, the pending-operation queue and conflicts.
///
/// Records are keyed by `(kind, local id)`. The queue is keyed by
/// `(entity_type, entity_id)`, so an entity never has more than one
/// operation stored.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get a record by local id.
    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<Record>>;

    /// Resolve a reference that may hold either a local or a server id.
    async fn resolve(&self, kind: EntityKind, reference: i64) -> Result<Option<Record>>;

    async fn get_by_server_id(&self, kind: EntityKind, server_id: i64) -> Result<Option<Record>>;

    async fn get_by_uuid(&self, kind: EntityKind, uuid: &str) -> Result<Option<Record>>;

    /// All records of a kind, deleted ones included.
    async fn list(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Records of `kind` whose reference to `parent` is any of `parent_ids`.
    async fn children(
        &self,
        kind: EntityKind,
        parent: EntityKind,
        parent_ids: &[i64],
    ) -> Result<Vec<Record>>;

    /// Insert or replace a record.
    async fn save(&self, record: Record) -> Result<()>;

    async fn save_all(&self, records: Vec<Record>) -> Result<()>;

    /// Remove a record outright.
    async fn purge(&self, kind: EntityKind, id: i64) -> Result<bool>;

    /// Rewrite `parent` references equal to `old` in every `child` record.
    ///
    /// # Postconditions
    /// - Returns the number of rows changed; a repeated call returns 0
    async fn reassign_references(
        &self,
        child: EntityKind,
        parent: EntityKind,
        old: i64,
        new: i64,
    ) -> Result<usize>;

    /// Soft-delete records by server id and drop their queued operations.
    async fn mark_deleted_by_server_ids(&self, kind: EntityKind, server_ids: &[i64])
        -> Result<usize>;

    /// Soft-delete a project (by server id) with every record that belongs to it.
    async fn cascade_delete_project(&self, server_id: i64) -> Result<usize>;

    /// Store an operation, replacing any operation for the same entity.
    async fn enqueue_operation(&self, op: PendingOperation) -> Result<()>;

    async fn operation_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Option<PendingOperation>>;

    async fn get_operation(&self, operation_id: &str) -> Result<Option<PendingOperation>>;

    async fn remove_operation(&self, operation_id: &str) -> Result<bool>;

    async fn remove_operations_for_entity(&self, kind: EntityKind, entity_id: i64)
        -> Result<usize>;

    /// Due operations ordered by priority, then creation time.
    async fn pending_operations(&self, now: DateTime<Utc>) -> Result<Vec<PendingOperation>>;

    /// Every stored operation of a kind regardless of status.
    async fn operations_for_kind(&self, kind: EntityKind) -> Result<Vec<PendingOperation>>;

    /// Every stored operation.
    async fn operations(&self) -> Result<Vec<PendingOperation>>;

    /// Earliest `scheduled_at` among pending operations.
    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Move FAILED operations back to PENDING with counters reset.
    async fn reset_failed_operations(&self) -> Result<usize>;

    async fn save_conflict(&self, conflict: ConflictRecord) -> Result<()>;

    /// Unresolved conflicts.
    async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>>;
}
