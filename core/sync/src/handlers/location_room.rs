//! Locations and rooms.
//!
//! Updates of both kinds get one automatic conflict retry: on a stale lock
//! the current server row is fetched and the update is resent with its
//! `updated_at`. Only a second rejection is parked as a conflict.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use fieldsync_common::time::format_api_timestamp;
use fieldsync_common::{EntityKind, Result};
use fieldsync_storage::queue::{LocationCreatePayload, RoomCreatePayload};
use fieldsync_storage::{
    EntityBody, OperationPayload, OperationType, PendingOperation, Record, SyncStatus,
};

use super::{missing_locally, unsupported, waiting_for, PushContext, PushHandler};
use crate::outcome::OperationOutcome;

pub struct LocationRoomPushHandler {
    push: PushContext,
}

impl LocationRoomPushHandler {
    pub(crate) fn new(push: PushContext) -> Self {
        Self { push }
    }

    async fn create_location(
        &self,
        op: &PendingOperation,
        payload: &LocationCreatePayload,
    ) -> Result<OperationOutcome> {
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let EntityBody::Location(mut body) = record.body.clone() else {
            return Ok(unsupported(op));
        };

        let Some(project_id) = self
            .push
            .server_id_for(EntityKind::Project, payload.project_id)
            .await?
        else {
            return Ok(OperationOutcome::skip(waiting_for(
                EntityKind::Project,
                payload.project_id,
            )));
        };
        body.project_id = project_id;

        if let Some(property) = payload.property_local_id {
            match self.push.server_id_for(EntityKind::Property, property).await? {
                Some(server_id) => body.property_id = Some(server_id),
                None => {
                    return Ok(OperationOutcome::skip(waiting_for(
                        EntityKind::Property,
                        property,
                    )))
                }
            }
        }

        let body = match self.push.resolve_body(&EntityBody::Location(body)).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };

        let local_id = record.id;
        let saved = match self.push.create(op, record, body).await? {
            Ok(saved) => saved,
            Err(outcome) => return Ok(outcome),
        };
        if let Some(server_id) = saved.server_id {
            let remapped = self
                .push
                .remap
                .remap_location_id(local_id, server_id, &payload.location_uuid)
                .await?;
            info!(
                operation_id = %op.operation_id,
                "Location {} created as {} ({} references remapped)",
                local_id,
                server_id,
                remapped.count()
            );
        }
        Ok(OperationOutcome::Success)
    }

    /// Server id of a location named by server id (if positive) or by uuid.
    async fn location_server_id(
        &self,
        server_id: Option<i64>,
        uuid: Option<&str>,
    ) -> Result<Option<i64>> {
        if let Some(id) = server_id.filter(|id| *id > 0) {
            return Ok(Some(id));
        }
        match uuid {
            Some(uuid) => Ok(self
                .push
                .ctx
                .store
                .get_by_uuid(EntityKind::Location, uuid)
                .await?
                .and_then(|location| location.server_id)),
            None => Ok(None),
        }
    }

    async fn create_room(
        &self,
        op: &PendingOperation,
        payload: &RoomCreatePayload,
    ) -> Result<OperationOutcome> {
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let EntityBody::Room(mut body) = record.body.clone() else {
            return Ok(unsupported(op));
        };

        let Some(project_id) = self
            .push
            .server_id_for(EntityKind::Project, payload.project_id)
            .await?
        else {
            return Ok(OperationOutcome::skip(waiting_for(
                EntityKind::Project,
                payload.project_id,
            )));
        };

        let level = self
            .location_server_id(payload.level_server_id, payload.level_uuid.as_deref())
            .await?;
        let mut location = self
            .location_server_id(payload.location_server_id, payload.location_uuid.as_deref())
            .await?;

        // Single-unit properties use one location as both level and unit.
        if location.is_none()
            && level.is_some()
            && payload.level_uuid.is_some()
            && payload.level_uuid == payload.location_uuid
        {
            debug!(
                operation_id = %op.operation_id,
                "Using level {:?} as location for single-unit room",
                level
            );
            location = level;
        }

        let wants_level = payload.level_server_id.is_some() || payload.level_uuid.is_some();
        let wants_location =
            payload.location_server_id.is_some() || payload.location_uuid.is_some();
        if wants_level && level.is_none() {
            let name = payload
                .level_uuid
                .clone()
                .or_else(|| payload.level_server_id.map(|id| id.to_string()))
                .unwrap_or_default();
            return Ok(OperationOutcome::skip(format!(
                "waiting for level {} to sync",
                name
            )));
        }
        if wants_location && location.is_none() {
            let name = payload
                .location_uuid
                .clone()
                .or_else(|| payload.location_server_id.map(|id| id.to_string()))
                .unwrap_or_default();
            return Ok(OperationOutcome::skip(waiting_for(EntityKind::Location, name)));
        }

        body.project_id = project_id;
        if wants_level {
            body.level_id = level;
        }
        if wants_location {
            body.location_id = location;
        }
        let body = match self.push.resolve_body(&EntityBody::Room(body)).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };

        let local_id = record.id;
        let saved = match self.push.create(op, record, body).await? {
            Ok(saved) => saved,
            Err(outcome) => return Ok(outcome),
        };
        if let Some(server_id) = saved.server_id {
            let remapped = self
                .push
                .remap
                .remap_room_id(local_id, server_id, &payload.room_uuid)
                .await?;
            info!(
                operation_id = %op.operation_id,
                "Room {} created as {} ({} references remapped)",
                local_id,
                server_id,
                remapped.count()
            );
        }
        Ok(OperationOutcome::Success)
    }

    /// Update with one refresh-and-retry on a stale lock.
    async fn update_with_refresh(
        &self,
        op: &PendingOperation,
        record: Record,
    ) -> Result<OperationOutcome> {
        let Some(server_id) = record.server_id else {
            return Ok(OperationOutcome::skip(waiting_for(op.entity_type, record.id)));
        };
        let body = match self.push.resolve_body(&record.body).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };
        let remote = &self.push.ctx.remote;

        let lock = PushContext::lock_token(op, &record);
        let first = match remote.update(op.entity_type, server_id, &body, &lock).await {
            Ok(updated) => {
                self.push.finish_update(record, updated.updated_at).await?;
                return Ok(OperationOutcome::Success);
            }
            Err(err) if err.is_conflict() => err,
            Err(err) => return Err(err.into()),
        };

        let fresh = match remote.get(op.entity_type, server_id).await {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(
                    operation_id = %op.operation_id,
                    entity_type = %op.entity_type,
                    entity_id = op.entity_id,
                    "Could not refresh {} {} after conflict ({}); abandoning local edit",
                    op.entity_type,
                    server_id,
                    err
                );
                let mut record = record;
                record.is_dirty = false;
                record.sync_status = SyncStatus::Synced;
                self.push.ctx.store.save(record).await?;
                return Ok(OperationOutcome::dropped(format!(
                    "conflict refresh failed: {}",
                    first.message
                )));
            }
        };

        let retry_lock = format_api_timestamp(&fresh.updated_at);
        debug!(
            operation_id = %op.operation_id,
            "Retrying {} {} with refreshed lock {}",
            op.entity_type,
            server_id,
            retry_lock
        );
        match remote
            .update(op.entity_type, server_id, &body, &retry_lock)
            .await
        {
            Ok(updated) => {
                self.push.finish_update(record, updated.updated_at).await?;
                Ok(OperationOutcome::Success)
            }
            Err(err) if err.is_conflict() => self.push.record_conflict(op, Some(record), &err).await,
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl PushHandler for LocationRoomPushHandler {
    fn name(&self) -> &'static str {
        "location_room"
    }

    async fn push(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        match (op.operation_type, &op.payload) {
            (OperationType::Create, OperationPayload::LocationCreate(p))
                if op.entity_type == EntityKind::Location =>
            {
                self.create_location(op, p).await
            }
            (OperationType::Create, OperationPayload::RoomCreate(p))
                if op.entity_type == EntityKind::Room =>
            {
                self.create_room(op, p).await
            }
            (OperationType::Update, _) => match self.push.load(op).await? {
                Some(record) => self.update_with_refresh(op, record).await,
                None => Ok(missing_locally(op)),
            },
            (OperationType::Delete, _) => {
                let record = self.push.load(op).await?;
                self.push.delete(op, record).await
            }
            _ => Ok(unsupported(op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{harness, TestHarness};
    use crate::context::SyncContext;
    use crate::handlers::tests::push_context;
    use crate::remap::IdRemapService;
    use fieldsync_remote::{
        ApiError, ApiResult, DatedResponse, DeletedRecords, ListQuery, MemoryRemote, Page,
        RemoteApi, RemoteRecord,
    };
    use fieldsync_storage::model::{LocationBody, RoomBody};
    use fieldsync_storage::{LocalStore, OperationPriority};
    use std::sync::Arc;

    fn location_body(project_id: i64) -> EntityBody {
        EntityBody::Location(LocationBody {
            project_id,
            property_id: None,
            title: "Unit 4".to_string(),
            location_type: "unit".to_string(),
            parent_location_id: None,
        })
    }

    fn room_body(location: i64) -> EntityBody {
        EntityBody::Room(RoomBody {
            project_id: 400,
            location_id: Some(location),
            level_id: Some(location),
            title: "Kitchen".to_string(),
            room_type: Some("kitchen".to_string()),
        })
    }

    async fn synced_location(h: &TestHarness) -> Record {
        let remote = h.remote.seed(location_body(400));
        let mut record = Record::new_local(-30, location_body(400));
        record.uuid = remote.uuid.clone().unwrap();
        record.mark_synced(remote.id, remote.updated_at);
        h.store.save(record.clone()).await.unwrap();
        record
    }

    fn room_op(location_uuid: &str) -> PendingOperation {
        PendingOperation::new(
            EntityKind::Room,
            -50,
            "room-uuid",
            OperationType::Create,
            OperationPayload::RoomCreate(RoomCreatePayload {
                room_local_id: -50,
                room_uuid: "room-uuid".to_string(),
                project_id: 400,
                level_server_id: None,
                level_uuid: Some(location_uuid.to_string()),
                location_server_id: None,
                location_uuid: Some(location_uuid.to_string()),
                idempotency_key: "room-key".to_string(),
            }),
            OperationPriority::High,
        )
        .unwrap()
    }

    fn update_op(kind: EntityKind, id: i64, lock: &str) -> PendingOperation {
        PendingOperation::new(
            kind,
            id,
            "x",
            OperationType::Update,
            OperationPayload::lock(Some(lock.to_string())),
            OperationPriority::Medium,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_room_waits_for_location_by_uuid() {
        let h = harness();
        h.store
            .save(Record::new_local(-50, room_body(-30)))
            .await
            .unwrap();
        let handler = LocationRoomPushHandler::new(push_context(&h));

        let outcome = handler.push(&room_op("missing-uuid")).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Skip(ref hint) if hint.contains("missing-uuid")));
    }

    #[tokio::test]
    async fn test_room_create_resolves_single_unit_location() {
        let h = harness();
        let location = synced_location(&h).await;
        h.store
            .save(Record::new_local(-50, room_body(-30)))
            .await
            .unwrap();
        let handler = LocationRoomPushHandler::new(push_context(&h));

        let outcome = handler.push(&room_op(&location.uuid)).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Success);

        let room = h.store.get(EntityKind::Room, -50).await.unwrap().unwrap();
        let on_server = h
            .remote
            .get(EntityKind::Room, room.server_id.unwrap())
            .await
            .unwrap();
        assert_eq!(on_server.body.reference(EntityKind::Location), location.server_id);
    }

    #[tokio::test]
    async fn test_update_conflict_retries_once_with_fresh_lock() {
        let h = harness();
        let location = synced_location(&h).await;
        let stale = format_api_timestamp(&location.updated_at);
        let server_id = location.server_id.unwrap();
        h.remote.edit(EntityKind::Location, server_id, |_| {});

        let handler = LocationRoomPushHandler::new(push_context(&h));
        let outcome = handler
            .push(&update_op(EntityKind::Location, -30, &stale))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Success);
        assert!(h.store.open_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_failure_abandons_local_edit() {
        let h = harness();
        let mut location = synced_location(&h).await;
        let lock = format_api_timestamp(&location.updated_at);
        location.is_dirty = true;
        location.sync_status = SyncStatus::Pending;
        h.store.save(location).await.unwrap();
        h.remote.fail_next(ApiError::http(409, "stale"));
        h.remote.fail_next(ApiError::network("offline"));

        let handler = LocationRoomPushHandler::new(push_context(&h));
        let outcome = handler
            .push(&update_op(EntityKind::Location, -30, &lock))
            .await
            .unwrap();

        assert!(matches!(outcome, OperationOutcome::Drop(_)));
        let stored = h.store.get(EntityKind::Location, -30).await.unwrap().unwrap();
        assert!(!stored.is_dirty);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    /// Server whose updates always report a stale lock.
    struct AlwaysStale(Arc<MemoryRemote>);

    #[async_trait]
    impl RemoteApi for AlwaysStale {
        async fn list(&self, query: &ListQuery) -> ApiResult<Page<RemoteRecord>> {
            self.0.list(query).await
        }

        async fn get(&self, kind: EntityKind, server_id: i64) -> ApiResult<RemoteRecord> {
            self.0.get(kind, server_id).await
        }

        async fn create(
            &self,
            kind: EntityKind,
            uuid: &str,
            body: &EntityBody,
            idempotency_key: &str,
        ) -> ApiResult<RemoteRecord> {
            self.0.create(kind, uuid, body, idempotency_key).await
        }

        async fn update(
            &self,
            kind: EntityKind,
            server_id: i64,
            _body: &EntityBody,
            _lock_updated_at: &str,
        ) -> ApiResult<RemoteRecord> {
            let current = self.0.get(kind, server_id).await?;
            Err(ApiError::http(409, "modified concurrently")
                .with_body(serde_json::to_string(&current).unwrap_or_default()))
        }

        async fn delete(&self, kind: EntityKind, server_id: i64, lock: &str) -> ApiResult<()> {
            self.0.delete(kind, server_id, lock).await
        }

        async fn deleted_records(
            &self,
            since: &str,
            types: &[String],
        ) -> ApiResult<DatedResponse<DeletedRecords>> {
            self.0.deleted_records(since, types).await
        }
    }

    #[tokio::test]
    async fn test_second_conflict_is_recorded() {
        let h = harness();
        let location = synced_location(&h).await;
        let lock = format_api_timestamp(&location.updated_at);

        let ctx = SyncContext::new(
            h.ctx.store.clone(),
            Arc::new(AlwaysStale(h.remote.clone())),
            h.ctx.checkpoints.clone(),
            h.ctx.network.clone(),
        );
        let push = PushContext::new(ctx, IdRemapService::new(h.ctx.store.clone()));
        let handler = LocationRoomPushHandler::new(push);

        let outcome = handler
            .push(&update_op(EntityKind::Location, -30, &lock))
            .await
            .unwrap();

        assert!(matches!(outcome, OperationOutcome::ConflictPending(_)));
        let conflicts = h.store.open_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_id, -30);
        assert!(conflicts[0].remote_version.is_object());
        let stored = h.store.get(EntityKind::Location, -30).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
    }
}
