//! Local id to server id remapping.
//!
//! When a parent is created on the server, everything that still refers to it
//! by its local (negative) id has to follow. Two places hold such references:
//! still-pending CREATE payloads of child operations, and foreign keys of
//! child rows already in the local store. Every remap is idempotent; a
//! repeated call finds nothing left to rewrite.

use std::sync::Arc;
use tracing::{debug, info};

use fieldsync_common::{EntityKind, Result};
use fieldsync_storage::{LocalStore, OperationPayload};

/// What one remap call rewrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapResult {
    pub entity_type: EntityKind,
    pub old_id: i64,
    pub new_id: i64,
    /// Pending operation payloads rewritten.
    pub operations_updated: usize,
    /// Stored child rows rewritten.
    pub rows_updated: usize,
}

impl RemapResult {
    fn empty(entity_type: EntityKind, old_id: i64, new_id: i64) -> Self {
        Self {
            entity_type,
            old_id,
            new_id,
            operations_updated: 0,
            rows_updated: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.operations_updated + self.rows_updated
    }
}

const PROJECT_CHILDREN: [EntityKind; 11] = [
    EntityKind::Property,
    EntityKind::Location,
    EntityKind::Room,
    EntityKind::Note,
    EntityKind::Equipment,
    EntityKind::MoistureLog,
    EntityKind::AtmosphericLog,
    EntityKind::Photo,
    EntityKind::Album,
    EntityKind::Damage,
    EntityKind::WorkScope,
];

const ROOM_CHILDREN: [EntityKind; 8] = [
    EntityKind::Note,
    EntityKind::Equipment,
    EntityKind::MoistureLog,
    EntityKind::AtmosphericLog,
    EntityKind::Photo,
    EntityKind::Album,
    EntityKind::Damage,
    EntityKind::WorkScope,
];

/// Rewrites references after a parent receives its server id.
#[derive(Clone)]
pub struct IdRemapService {
    store: Arc<dyn LocalStore>,
}

impl IdRemapService {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Rewrite `parent` references in stored rows of every `children` kind.
    async fn reassign_rows(
        &self,
        children: &[EntityKind],
        parent: EntityKind,
        old: i64,
        new: i64,
    ) -> Result<usize> {
        let mut total = 0;
        for child in children {
            total += self
                .store
                .reassign_references(*child, parent, old, new)
                .await?;
        }
        Ok(total)
    }

    /// Apply `rewrite` to every stored operation of `kind`, persisting the changed ones.
    async fn rewrite_operations<F>(&self, kind: EntityKind, mut rewrite: F) -> Result<usize>
    where
        F: FnMut(&mut OperationPayload) -> bool + Send,
    {
        let mut updated = 0;
        for mut op in self.store.operations_for_kind(kind).await? {
            if rewrite(&mut op.payload) {
                debug!(
                    operation_id = %op.operation_id,
                    entity_type = %kind,
                    "Rewrote pending payload reference"
                );
                self.store.enqueue_operation(op).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn report(result: RemapResult) -> RemapResult {
        if result.count() > 0 {
            info!(
                entity_type = %result.entity_type,
                "Remapped {} -> {}: {} operations, {} rows",
                result.old_id,
                result.new_id,
                result.operations_updated,
                result.rows_updated
            );
        }
        result
    }

    /// Point property, location and room creates plus every project-owned row at the server project id.
    pub async fn remap_project_id(&self, local_id: i64, server_id: i64) -> Result<RemapResult> {
        let mut result = RemapResult::empty(EntityKind::Project, local_id, server_id);
        if local_id == server_id {
            return Ok(result);
        }

        result.operations_updated += self
            .rewrite_operations(EntityKind::Property, |payload| match payload {
                OperationPayload::PropertyCreate(p) if p.project_id == local_id => {
                    p.project_id = server_id;
                    true
                }
                OperationPayload::PropertyUpdate(p) if p.project_id == local_id => {
                    p.project_id = server_id;
                    true
                }
                _ => false,
            })
            .await?;
        result.operations_updated += self
            .rewrite_operations(EntityKind::Location, |payload| match payload {
                OperationPayload::LocationCreate(p) if p.project_id == local_id => {
                    p.project_id = server_id;
                    true
                }
                _ => false,
            })
            .await?;
        result.operations_updated += self
            .rewrite_operations(EntityKind::Room, |payload| match payload {
                OperationPayload::RoomCreate(p) if p.project_id == local_id => {
                    p.project_id = server_id;
                    true
                }
                _ => false,
            })
            .await?;

        result.rows_updated = self
            .reassign_rows(&PROJECT_CHILDREN, EntityKind::Project, local_id, server_id)
            .await?;
        Ok(Self::report(result))
    }

    /// Point location creates, locations and the owning project at the server property id.
    pub async fn remap_property_id(&self, local_id: i64, server_id: i64) -> Result<RemapResult> {
        let mut result = RemapResult::empty(EntityKind::Property, local_id, server_id);
        if local_id == server_id {
            return Ok(result);
        }

        result.operations_updated = self
            .rewrite_operations(EntityKind::Location, |payload| match payload {
                OperationPayload::LocationCreate(p) if p.property_local_id == Some(local_id) => {
                    p.property_local_id = Some(server_id);
                    true
                }
                _ => false,
            })
            .await?;

        result.rows_updated = self
            .reassign_rows(
                &[EntityKind::Location, EntityKind::Project],
                EntityKind::Property,
                local_id,
                server_id,
            )
            .await?;
        Ok(Self::report(result))
    }

    /// Point room creates (by id, or by uuid when the id was never known) and stored rooms at the server location id.
    pub async fn remap_location_id(
        &self,
        local_id: i64,
        server_id: i64,
        uuid: &str,
    ) -> Result<RemapResult> {
        let mut result = RemapResult::empty(EntityKind::Location, local_id, server_id);
        if local_id == server_id {
            return Ok(result);
        }

        let matches = |id: Option<i64>, slot_uuid: Option<&str>| {
            id == Some(local_id) || (id != Some(server_id) && slot_uuid == Some(uuid))
        };
        result.operations_updated = self
            .rewrite_operations(EntityKind::Room, |payload| {
                let OperationPayload::RoomCreate(p) = payload else {
                    return false;
                };
                let mut changed = false;
                if matches(p.level_server_id, p.level_uuid.as_deref()) {
                    p.level_server_id = Some(server_id);
                    changed = true;
                }
                if matches(p.location_server_id, p.location_uuid.as_deref()) {
                    p.location_server_id = Some(server_id);
                    changed = true;
                }
                changed
            })
            .await?;

        result.rows_updated = self
            .reassign_rows(
                &[EntityKind::Room, EntityKind::Location],
                EntityKind::Location,
                local_id,
                server_id,
            )
            .await?;
        Ok(Self::report(result))
    }

    /// Point every stored room child at the server room id.
    ///
    /// Child creates read their room reference from the stored row at push
    /// time, so rewriting rows is enough for queued operations too.
    pub async fn remap_room_id(
        &self,
        local_id: i64,
        server_id: i64,
        uuid: &str,
    ) -> Result<RemapResult> {
        let mut result = RemapResult::empty(EntityKind::Room, local_id, server_id);
        if local_id == server_id {
            return Ok(result);
        }

        debug!(room_uuid = uuid, "Migrating room children {} -> {}", local_id, server_id);
        result.rows_updated = self
            .reassign_rows(&ROOM_CHILDREN, EntityKind::Room, local_id, server_id)
            .await?;
        Ok(Self::report(result))
    }

    /// Point stored support messages at the server conversation id.
    pub async fn remap_conversation_id(&self, local_id: i64, server_id: i64) -> Result<RemapResult> {
        let mut result = RemapResult::empty(EntityKind::SupportConversation, local_id, server_id);
        if local_id == server_id {
            return Ok(result);
        }
        result.rows_updated = self
            .reassign_rows(
                &[EntityKind::SupportMessage],
                EntityKind::SupportConversation,
                local_id,
                server_id,
            )
            .await?;
        Ok(Self::report(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_storage::model::{
        EquipmentBody, LocationBody, MoistureLogBody, NoteBody, ProjectBody, PropertyBody,
        RoomBody,
    };
    use fieldsync_storage::queue::{
        LocationCreatePayload, PropertyCreatePayload, RoomCreatePayload,
    };
    use fieldsync_storage::{
        EntityBody, MemoryStore, OperationPriority, OperationType, PendingOperation, Record,
    };

    const ROOM: i64 = -1_700_000_000_000;

    fn service() -> (Arc<MemoryStore>, IdRemapService) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), IdRemapService::new(store))
    }

    fn room_create(level: Option<i64>, level_uuid: Option<&str>) -> PendingOperation {
        PendingOperation::new(
            EntityKind::Room,
            -50,
            "room-uuid",
            OperationType::Create,
            OperationPayload::RoomCreate(RoomCreatePayload {
                room_local_id: -50,
                room_uuid: "room-uuid".to_string(),
                project_id: -1,
                level_server_id: level,
                level_uuid: level_uuid.map(str::to_string),
                location_server_id: None,
                location_uuid: None,
                idempotency_key: "k".to_string(),
            }),
            OperationPriority::High,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_room_remap_is_idempotent() {
        let (store, remap) = service();
        store
            .save(Record::new_local(
                -2,
                EntityBody::Note(NoteBody {
                    project_id: 7,
                    room_id: Some(ROOM),
                    content: "wet drywall".to_string(),
                    category_id: None,
                }),
            ))
            .await
            .unwrap();
        store
            .save(Record::new_local(
                -3,
                EntityBody::Equipment(EquipmentBody {
                    project_id: 7,
                    room_id: Some(ROOM),
                    equipment_type: "dehumidifier".to_string(),
                    quantity: 2,
                    status: "active".to_string(),
                }),
            ))
            .await
            .unwrap();
        store
            .save(Record::new_local(
                -4,
                EntityBody::MoistureLog(MoistureLogBody {
                    project_id: 7,
                    room_id: Some(ROOM),
                    material: "drywall".to_string(),
                    reading: 31.5,
                }),
            ))
            .await
            .unwrap();

        let first = remap.remap_room_id(ROOM, 9321, "room-uuid").await.unwrap();
        assert_eq!(first.rows_updated, 3);

        let second = remap.remap_room_id(ROOM, 9321, "room-uuid").await.unwrap();
        assert_eq!(second.count(), 0);

        let note = store.get(EntityKind::Note, -2).await.unwrap().unwrap();
        assert_eq!(note.body.reference(EntityKind::Room), Some(9321));
    }

    #[tokio::test]
    async fn test_same_id_is_noop() {
        let (_, remap) = service();
        let result = remap.remap_project_id(5, 5).await.unwrap();
        assert_eq!(result.count(), 0);
    }

    #[tokio::test]
    async fn test_project_remap_rewrites_payloads_and_rows() {
        let (store, remap) = service();
        store
            .save(Record::new_local(
                -10,
                EntityBody::Project(ProjectBody {
                    company_id: Some(3),
                    title: "Flood".to_string(),
                    status: "active".to_string(),
                    property_id: None,
                    assigned_user_ids: vec![],
                }),
            ))
            .await
            .unwrap();
        store
            .save(Record::new_local(
                -11,
                EntityBody::Property(PropertyBody {
                    project_id: -10,
                    address: "1 Main St".to_string(),
                    city: None,
                }),
            ))
            .await
            .unwrap();
        store
            .enqueue_operation(
                PendingOperation::new(
                    EntityKind::Property,
                    -11,
                    "p",
                    OperationType::Create,
                    OperationPayload::PropertyCreate(PropertyCreatePayload {
                        property_local_id: -11,
                        project_id: -10,
                        idempotency_key: "k".to_string(),
                    }),
                    OperationPriority::High,
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let result = remap.remap_project_id(-10, 400).await.unwrap();
        assert_eq!(result.operations_updated, 1);
        assert_eq!(result.rows_updated, 1);

        let op = store
            .operation_for_entity(EntityKind::Property, -11)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(op.payload, OperationPayload::PropertyCreate(ref p) if p.project_id == 400));
        assert_eq!(remap.remap_project_id(-10, 400).await.unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_property_remap_updates_location_payload() {
        let (store, remap) = service();
        store
            .enqueue_operation(
                PendingOperation::new(
                    EntityKind::Location,
                    -20,
                    "loc",
                    OperationType::Create,
                    OperationPayload::LocationCreate(LocationCreatePayload {
                        location_local_id: -20,
                        location_uuid: "loc".to_string(),
                        project_id: 400,
                        property_local_id: Some(-11),
                        idempotency_key: "k".to_string(),
                    }),
                    OperationPriority::High,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        store
            .save(Record::new_local(
                -20,
                EntityBody::Location(LocationBody {
                    project_id: 400,
                    property_id: Some(-11),
                    title: "Unit 1".to_string(),
                    location_type: "unit".to_string(),
                    parent_location_id: None,
                }),
            ))
            .await
            .unwrap();

        let result = remap.remap_property_id(-11, 500).await.unwrap();
        assert_eq!(result.operations_updated, 1);
        assert_eq!(result.rows_updated, 1);
    }

    #[tokio::test]
    async fn test_location_remap_matches_by_uuid() {
        let (store, remap) = service();
        store
            .enqueue_operation(room_create(None, Some("level-uuid")))
            .await
            .unwrap();
        store
            .save(Record::new_local(
                -50,
                EntityBody::Room(RoomBody {
                    project_id: 400,
                    location_id: Some(-30),
                    level_id: Some(-30),
                    title: "Bath".to_string(),
                    room_type: None,
                }),
            ))
            .await
            .unwrap();

        let result = remap.remap_location_id(-30, 600, "level-uuid").await.unwrap();
        assert_eq!(result.operations_updated, 1);
        assert_eq!(result.rows_updated, 1);

        let op = store
            .operation_for_entity(EntityKind::Room, -50)
            .await
            .unwrap()
            .unwrap();
        match op.payload {
            OperationPayload::RoomCreate(p) => {
                assert_eq!(p.level_server_id, Some(600));
                assert_eq!(p.location_server_id, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(
            remap.remap_location_id(-30, 600, "level-uuid").await.unwrap().count(),
            0
        );
    }
}
