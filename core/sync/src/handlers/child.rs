use async_trait::async_trait;

use fieldsync_common::{EntityKind, Result};
use fieldsync_storage::{OperationType, PendingOperation};

use super::{missing_locally, unsupported, PushContext, PushHandler};
use crate::outcome::OperationOutcome;

/// Notes, equipment, moisture and atmospheric logs, and photo deletes.
///
/// Every reference (project, room) is resolved to a server id at push time;
/// an unsynced parent yields a skip naming it.
pub struct ChildPushHandler {
    push: PushContext,
}

impl ChildPushHandler {
    pub(crate) fn new(push: PushContext) -> Self {
        Self { push }
    }

    async fn create(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let body = match self.push.resolve_body(&record.body).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };
        match self.push.create(op, record, body).await? {
            Ok(_) | Err(OperationOutcome::Success) => Ok(OperationOutcome::Success),
            Err(outcome) => Ok(outcome),
        }
    }
}

#[async_trait]
impl PushHandler for ChildPushHandler {
    fn name(&self) -> &'static str {
        "child"
    }

    async fn push(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        // Photos are uploaded elsewhere; only their deletion goes through the queue.
        if op.entity_type == EntityKind::Photo && op.operation_type != OperationType::Delete {
            return Ok(unsupported(op));
        }

        match op.operation_type {
            OperationType::Create => self.create(op).await,
            OperationType::Update => match self.push.load(op).await? {
                Some(record) => self.push.update(op, record).await,
                None => Ok(missing_locally(op)),
            },
            OperationType::Delete => {
                let record = self.push.load(op).await?;
                self.push.delete(op, record).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::handlers::tests::push_context;
    use chrono::Utc;
    use fieldsync_common::time::format_api_timestamp;
    use fieldsync_remote::ApiError;
    use fieldsync_storage::model::{AtmosphericLogBody, NoteBody, RoomBody};
    use fieldsync_storage::{
        EntityBody, LocalStore, OperationPayload, OperationPriority, Record, SyncStatus,
    };

    fn note(room_id: i64) -> EntityBody {
        EntityBody::Note(NoteBody {
            project_id: 400,
            room_id: Some(room_id),
            content: "Standing water under sink".to_string(),
            category_id: None,
        })
    }

    fn op(kind: EntityKind, id: i64, op_type: OperationType, payload: OperationPayload) -> PendingOperation {
        PendingOperation::new(kind, id, "uuid", op_type, payload, OperationPriority::Medium).unwrap()
    }

    #[tokio::test]
    async fn test_note_create_waits_for_room() {
        let h = harness();
        h.store
            .save(Record::new_local(
                -50,
                EntityBody::Room(RoomBody {
                    project_id: 400,
                    location_id: None,
                    level_id: None,
                    title: "Bath".to_string(),
                    room_type: None,
                }),
            ))
            .await
            .unwrap();
        h.store.save(Record::new_local(-2, note(-50))).await.unwrap();
        let handler = ChildPushHandler::new(push_context(&h));

        let outcome = handler
            .push(&op(EntityKind::Note, -2, OperationType::Create, OperationPayload::create("k")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OperationOutcome::Skip("waiting for room -50 to sync".to_string())
        );
    }

    #[tokio::test]
    async fn test_atmospheric_log_create_sends_server_refs() {
        let h = harness();
        let mut room = Record::new_local(
            -50,
            EntityBody::Room(RoomBody {
                project_id: 400,
                location_id: None,
                level_id: None,
                title: "Bath".to_string(),
                room_type: None,
            }),
        );
        room.mark_synced(9321, Utc::now());
        h.store.save(room).await.unwrap();
        h.store
            .save(Record::new_local(
                -3,
                EntityBody::AtmosphericLog(AtmosphericLogBody {
                    project_id: 400,
                    room_id: Some(-50),
                    relative_humidity: 61.0,
                    temperature: 22.5,
                }),
            ))
            .await
            .unwrap();
        let handler = ChildPushHandler::new(push_context(&h));

        let outcome = handler
            .push(&op(
                EntityKind::AtmosphericLog,
                -3,
                OperationType::Create,
                OperationPayload::create("atmo-key"),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Success);

        let stored = h.store.get(EntityKind::AtmosphericLog, -3).await.unwrap().unwrap();
        assert!(stored.server_id.is_some());
        assert_eq!(stored.body.reference(EntityKind::Room), Some(9321));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_update_conflict_is_parked_directly() {
        let h = harness();
        let remote = h.remote.seed(note(9321));
        let mut record = Record::new_local(-2, note(9321));
        record.mark_synced(remote.id, remote.updated_at);
        h.store.save(record.clone()).await.unwrap();
        h.remote.fail_next(ApiError::http(409, "stale").with_body("not json"));
        let handler = ChildPushHandler::new(push_context(&h));

        let outcome = handler
            .push(&op(
                EntityKind::Note,
                -2,
                OperationType::Update,
                OperationPayload::lock(Some(format_api_timestamp(&record.updated_at))),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, OperationOutcome::ConflictPending(_)));
        let conflicts = h.store.open_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].remote_version.is_null());
    }

    #[tokio::test]
    async fn test_photo_only_supports_delete() {
        let h = harness();
        let handler = ChildPushHandler::new(push_context(&h));
        let update = PendingOperation {
            operation_type: OperationType::Update,
            ..op(EntityKind::Photo, 8, OperationType::Delete, OperationPayload::lock(None))
        };
        let outcome = handler.push(&update).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Drop(_)));
    }

    #[tokio::test]
    async fn test_delete_of_never_synced_entity_succeeds_locally() {
        let h = harness();
        h.store.save(Record::new_local(-2, note(9321))).await.unwrap();
        let handler = ChildPushHandler::new(push_context(&h));

        let outcome = handler
            .push(&op(EntityKind::Note, -2, OperationType::Delete, OperationPayload::lock(None)))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Success);
        let stored = h.store.get(EntityKind::Note, -2).await.unwrap().unwrap();
        assert!(stored.is_deleted);
        assert_eq!(h.remote.create_calls(), 0);
    }
}
