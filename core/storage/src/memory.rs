//! In-memory local store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use fieldsync_common::{EntityKind, Error, Result};

use crate::model::Record;
use crate::queue::{OperationStatus, PendingOperation};
use crate::store::{ConflictRecord, LocalStore};

type Key = (EntityKind, i64);

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<Key, Record>,
    operations: BTreeMap<Key, PendingOperation>,
    conflicts: Vec<ConflictRecord>,
}

impl Inner {
    fn soft_delete(&mut self, key: Key) -> bool {
        let deleted = match self.records.get_mut(&key) {
            Some(record) if !record.is_deleted => {
                record.mark_deleted_synced();
                true
            }
            _ => false,
        };
        self.operations.remove(&key);
        deleted
    }
}

/// Serialized form of a [`MemoryStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<Record>,
    operations: Vec<PendingOperation>,
    conflicts: Vec<ConflictRecord>,
}

/// In-memory local store.
///
/// Useful for testing and development. State can be written to and read
/// back from a JSON snapshot so the CLI can inspect a queue between runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    /// Serialize the full store to JSON.
    pub fn to_json(&self) -> Result<String> {
        let inner = self.read()?;
        let snapshot = Snapshot {
            records: inner.records.values().cloned().collect(),
            operations: inner.operations.values().cloned().collect(),
            conflicts: inner.conflicts.clone(),
        };
        serde_json::to_string_pretty(&snapshot).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Rebuild a store from JSON produced by [`MemoryStore::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Snapshot =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let inner = Inner {
            records: snapshot
                .records
                .into_iter()
                .map(|r| ((r.kind(), r.id), r))
                .collect(),
            operations: snapshot
                .operations
                .into_iter()
                .map(|op| ((op.entity_type, op.entity_id), op))
                .collect(),
            conflicts: snapshot.conflicts,
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Write a snapshot file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        debug!("Saved store snapshot to {}", path.display());
        Ok(())
    }

    /// Load a snapshot file, or an empty store if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<Record>> {
        Ok(self.read()?.records.get(&(kind, id)).cloned())
    }

    async fn resolve(&self, kind: EntityKind, reference: i64) -> Result<Option<Record>> {
        let inner = self.read()?;
        if let Some(record) = inner.records.get(&(kind, reference)) {
            return Ok(Some(record.clone()));
        }
        Ok(inner
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, r)| r)
            .find(|r| r.server_id == Some(reference))
            .cloned())
    }

    async fn get_by_server_id(&self, kind: EntityKind, server_id: i64) -> Result<Option<Record>> {
        Ok(self
            .read()?
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, r)| r)
            .find(|r| r.server_id == Some(server_id))
            .cloned())
    }

    async fn get_by_uuid(&self, kind: EntityKind, uuid: &str) -> Result<Option<Record>> {
        Ok(self
            .read()?
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, r)| r)
            .find(|r| r.uuid == uuid)
            .cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Record>> {
        Ok(self
            .read()?
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn children(
        &self,
        kind: EntityKind,
        parent: EntityKind,
        parent_ids: &[i64],
    ) -> Result<Vec<Record>> {
        Ok(self
            .read()?
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| {
                r.body
                    .references()
                    .iter()
                    .any(|(k, id)| *k == parent && parent_ids.contains(id))
            })
            .cloned()
            .collect())
    }

    async fn save(&self, record: Record) -> Result<()> {
        self.write()?.records.insert((record.kind(), record.id), record);
        Ok(())
    }

    async fn save_all(&self, records: Vec<Record>) -> Result<()> {
        let mut inner = self.write()?;
        for record in records {
            inner.records.insert((record.kind(), record.id), record);
        }
        Ok(())
    }

    async fn purge(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let mut inner = self.write()?;
        inner.operations.remove(&(kind, id));
        Ok(inner.records.remove(&(kind, id)).is_some())
    }

    async fn reassign_references(
        &self,
        child: EntityKind,
        parent: EntityKind,
        old: i64,
        new: i64,
    ) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        let mut inner = self.write()?;
        let mut changed = 0;
        for (_, record) in inner.records.range_mut((child, i64::MIN)..=(child, i64::MAX)) {
            if record.body.remap_reference(parent, old, new) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_deleted_by_server_ids(
        &self,
        kind: EntityKind,
        server_ids: &[i64],
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let keys: Vec<Key> = inner
            .records
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .filter(|(_, r)| r.server_id.map_or(false, |id| server_ids.contains(&id)))
            .map(|(key, _)| *key)
            .collect();

        Ok(keys.into_iter().filter(|key| inner.soft_delete(*key)).count())
    }

    async fn cascade_delete_project(&self, server_id: i64) -> Result<usize> {
        let mut inner = self.write()?;
        let project = inner
            .records
            .range((EntityKind::Project, i64::MIN)..=(EntityKind::Project, i64::MAX))
            .map(|(_, r)| r)
            .find(|r| r.server_id == Some(server_id))
            .cloned();
        let Some(project) = project else {
            return Ok(0);
        };

        let project_ids: HashSet<i64> = project.known_ids().into_iter().collect();
        let mut keys: Vec<Key> = inner
            .records
            .iter()
            .filter(|(_, r)| r.body.project_id().map_or(false, |id| project_ids.contains(&id)))
            .map(|(key, _)| *key)
            .collect();
        keys.push((EntityKind::Project, project.id));

        Ok(keys.into_iter().filter(|key| inner.soft_delete(*key)).count())
    }

    async fn enqueue_operation(&self, op: PendingOperation) -> Result<()> {
        self.write()?
            .operations
            .insert((op.entity_type, op.entity_id), op);
        Ok(())
    }

    async fn operation_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Option<PendingOperation>> {
        Ok(self.read()?.operations.get(&(kind, entity_id)).cloned())
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<PendingOperation>> {
        Ok(self
            .read()?
            .operations
            .values()
            .find(|op| op.operation_id == operation_id)
            .cloned())
    }

    async fn remove_operation(&self, operation_id: &str) -> Result<bool> {
        let mut inner = self.write()?;
        let before = inner.operations.len();
        inner.operations.retain(|_, op| op.operation_id != operation_id);
        Ok(inner.operations.len() != before)
    }

    async fn remove_operations_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<usize> {
        Ok(self
            .write()?
            .operations
            .remove(&(kind, entity_id))
            .map_or(0, |_| 1))
    }

    async fn pending_operations(&self, now: DateTime<Utc>) -> Result<Vec<PendingOperation>> {
        let mut due: Vec<PendingOperation> = self
            .read()?
            .operations
            .values()
            .filter(|op| op.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(due)
    }

    async fn operations_for_kind(&self, kind: EntityKind) -> Result<Vec<PendingOperation>> {
        Ok(self
            .read()?
            .operations
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .map(|(_, op)| op.clone())
            .collect())
    }

    async fn operations(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.read()?.operations.values().cloned().collect())
    }

    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read()?
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter_map(|op| op.scheduled_at)
            .min())
    }

    async fn reset_failed_operations(&self) -> Result<usize> {
        let mut inner = self.write()?;
        let mut reset = 0;
        for op in inner.operations.values_mut() {
            if op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.skip_count = 0;
                op.scheduled_at = None;
                op.error_message = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn save_conflict(&self, conflict: ConflictRecord) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .conflicts
            .retain(|existing| existing.conflict_id != conflict.conflict_id);
        inner.conflicts.push(conflict);
        Ok(())
    }

    async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self
            .read()?
            .conflicts
            .iter()
            .filter(|c| c.resolved_at.is_none())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityBody, NoteBody, ProjectBody, RoomBody};
    use crate::queue::{OperationPayload, OperationPriority, OperationType};
    use chrono::Duration;

    fn project(id: i64, server_id: Option<i64>) -> Record {
        let mut record = Record::new_local(
            id,
            EntityBody::Project(ProjectBody {
                company_id: Some(1),
                title: "Flood".to_string(),
                status: "active".to_string(),
                property_id: None,
                assigned_user_ids: vec![],
            }),
        );
        record.server_id = server_id;
        record
    }

    fn note(id: i64, project_id: i64, room_id: Option<i64>) -> Record {
        Record::new_local(
            id,
            EntityBody::Note(NoteBody {
                project_id,
                room_id,
                content: "wet drywall".to_string(),
                category_id: None,
            }),
        )
    }

    fn op(kind: EntityKind, id: i64, priority: OperationPriority) -> PendingOperation {
        PendingOperation::new(
            kind,
            id,
            format!("uuid-{}", id),
            OperationType::Delete,
            OperationPayload::lock(None),
            priority,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_by_local_or_server_id() {
        let store = MemoryStore::new();
        store.save(project(-1, Some(77))).await.unwrap();

        assert_eq!(store.resolve(EntityKind::Project, -1).await.unwrap().unwrap().id, -1);
        assert_eq!(store.resolve(EntityKind::Project, 77).await.unwrap().unwrap().id, -1);
        assert!(store.resolve(EntityKind::Project, 78).await.unwrap().is_none());
        assert!(store.resolve(EntityKind::Room, -1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_operation_per_entity() {
        let store = MemoryStore::new();
        store.enqueue_operation(op(EntityKind::Note, -2, OperationPriority::Low)).await.unwrap();
        store.enqueue_operation(op(EntityKind::Note, -2, OperationPriority::High)).await.unwrap();

        let ops = store.operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].priority, OperationPriority::High);
    }

    #[tokio::test]
    async fn test_pending_order_and_schedule() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let low = op(EntityKind::Note, -1, OperationPriority::Low);
        let high = op(EntityKind::Note, -2, OperationPriority::High);
        let mut later = op(EntityKind::Note, -3, OperationPriority::Critical);
        later.scheduled_at = Some(now + Duration::minutes(5));

        for o in [low, high, later] {
            store.enqueue_operation(o).await.unwrap();
        }

        let due = store.pending_operations(now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|o| o.entity_id).collect();
        assert_eq!(ids, vec![-2, -1]);
        assert_eq!(
            store.next_scheduled_at().await.unwrap(),
            Some(now + Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn test_reassign_references_is_idempotent() {
        let store = MemoryStore::new();
        store.save(note(-10, 5, Some(-3))).await.unwrap();
        store.save(note(-11, 5, Some(-4))).await.unwrap();

        let first = store
            .reassign_references(EntityKind::Note, EntityKind::Room, -3, 900)
            .await
            .unwrap();
        let second = store
            .reassign_references(EntityKind::Note, EntityKind::Room, -3, 900)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        let moved = store.children(EntityKind::Note, EntityKind::Room, &[900]).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, -10);
    }

    #[tokio::test]
    async fn test_cascade_delete_project() {
        let store = MemoryStore::new();
        store.save(project(-1, Some(40))).await.unwrap();
        store.save(note(-2, 40, None)).await.unwrap();
        store.save(note(-3, -1, None)).await.unwrap();
        store.save(note(-4, 41, None)).await.unwrap();
        store
            .save(Record::new_local(
                -5,
                EntityBody::Room(RoomBody {
                    project_id: 40,
                    location_id: None,
                    level_id: None,
                    title: "Bath".to_string(),
                    room_type: None,
                }),
            ))
            .await
            .unwrap();
        store.enqueue_operation(op(EntityKind::Note, -2, OperationPriority::Medium)).await.unwrap();

        let deleted = store.cascade_delete_project(40).await.unwrap();

        assert_eq!(deleted, 4);
        assert!(store.get(EntityKind::Note, -3).await.unwrap().unwrap().is_deleted);
        assert!(!store.get(EntityKind::Note, -4).await.unwrap().unwrap().is_deleted);
        assert!(store.operations().await.unwrap().is_empty());
        assert_eq!(store.cascade_delete_project(40).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_failed_operations() {
        let store = MemoryStore::new();
        let mut failed = op(EntityKind::Room, 3, OperationPriority::Medium);
        failed.status = OperationStatus::Failed;
        failed.retry_count = 3;
        failed.error_message = Some("boom".to_string());
        let mut conflict = op(EntityKind::Room, 4, OperationPriority::Medium);
        conflict.status = OperationStatus::Conflict;
        store.enqueue_operation(failed).await.unwrap();
        store.enqueue_operation(conflict).await.unwrap();

        assert_eq!(store.reset_failed_operations().await.unwrap(), 1);
        let reset = store.operation_for_entity(EntityKind::Room, 3).await.unwrap().unwrap();
        assert_eq!(reset.status, OperationStatus::Pending);
        assert_eq!(reset.retry_count, 0);
        assert!(reset.error_message.is_none());
        let untouched = store.operation_for_entity(EntityKind::Room, 4).await.unwrap().unwrap();
        assert_eq!(untouched.status, OperationStatus::Conflict);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.save(note(-2, 40, Some(-9))).await.unwrap();
        store.enqueue_operation(op(EntityKind::Note, -2, OperationPriority::Medium)).await.unwrap();
        store.save_to(&path).unwrap();

        let loaded = MemoryStore::load_from(&path).unwrap();
        assert_eq!(
            loaded.get(EntityKind::Note, -2).await.unwrap(),
            store.get(EntityKind::Note, -2).await.unwrap()
        );
        assert_eq!(loaded.operations().await.unwrap().len(), 1);

        let empty = MemoryStore::load_from(&dir.path().join("missing.json")).unwrap();
        assert!(empty.operations().await.unwrap().is_empty());
    }
}
