use async_trait::async_trait;
use tracing::{info, warn};

use fieldsync_common::{is_local_id, Error, Result};
use fieldsync_storage::{EntityBody, OperationPayload, OperationType, PendingOperation};

use super::{missing_locally, unsupported, PushContext, PushHandler};
use crate::outcome::OperationOutcome;

/// Pushes project creates, updates and deletes.
pub struct ProjectPushHandler {
    push: PushContext,
}

impl ProjectPushHandler {
    pub(crate) fn new(push: PushContext) -> Self {
        Self { push }
    }

    async fn create(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        let OperationPayload::ProjectCreate(payload) = &op.payload else {
            return Ok(unsupported(op));
        };
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let EntityBody::Project(mut body) = record.body.clone() else {
            return Ok(unsupported(op));
        };

        // The property is created after the project; never send its local id.
        if body.property_id.map_or(false, is_local_id) {
            body.property_id = None;
        }
        if payload.company_id.is_some() {
            body.company_id = payload.company_id;
        }

        let local_id = record.id;
        let key = payload.idempotency_key.clone();
        if let Some(server_id) = record.server_id {
            self.push.remap.remap_project_id(local_id, server_id).await?;
            return Ok(OperationOutcome::Success);
        }

        let created = self
            .push
            .ctx
            .remote
            .create(op.entity_type, &record.uuid, &EntityBody::Project(body), &key)
            .await?;

        if let (Some(expected), EntityBody::Project(returned)) = (payload.company_id, &created.body) {
            if returned.company_id != Some(expected) {
                warn!(
                    operation_id = %op.operation_id,
                    "Server placed project {} in company {:?}, expected {}",
                    created.id,
                    returned.company_id,
                    expected
                );
                return Err(Error::Conflict(format!(
                    "project {} created in company {:?} instead of {}",
                    created.id, returned.company_id, expected
                )));
            }
        }

        // Keep the local body: its property reference is still remapped later.
        let mut saved = record;
        saved.mark_synced(created.id, created.updated_at);
        self.push.ctx.store.save(saved).await?;

        let remapped = self.push.remap.remap_project_id(local_id, created.id).await?;
        info!(
            operation_id = %op.operation_id,
            "Project {} created as {} ({} references remapped)",
            local_id,
            created.id,
            remapped.count()
        );
        Ok(OperationOutcome::Success)
    }
}

#[async_trait]
impl PushHandler for ProjectPushHandler {
    fn name(&self) -> &'static str {
        "project"
    }

    async fn push(&self, op: &PendingOperation) -> Result<OperationOutcome> {
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
    use fieldsync_common::EntityKind;
    use fieldsync_remote::RemoteApi;
    use fieldsync_storage::model::{ProjectBody, PropertyBody};
    use fieldsync_storage::queue::{ProjectCreatePayload, PropertyCreatePayload};
    use fieldsync_storage::{LocalStore, OperationPriority, Record};

    fn project(property_id: Option<i64>) -> EntityBody {
        EntityBody::Project(ProjectBody {
            company_id: Some(3),
            title: "Flooded basement".to_string(),
            status: "active".to_string(),
            property_id,
            assigned_user_ids: vec![9],
        })
    }

    fn create_op(local_id: i64, uuid: &str, company_id: Option<i64>) -> PendingOperation {
        PendingOperation::new(
            EntityKind::Project,
            local_id,
            uuid,
            OperationType::Create,
            OperationPayload::ProjectCreate(ProjectCreatePayload {
                local_project_id: local_id,
                company_id,
                idempotency_key: format!("key-{}", uuid),
            }),
            OperationPriority::Critical,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_strips_local_property_and_remaps() {
        let h = harness();
        let handler = ProjectPushHandler::new(push_context(&h));
        let record = Record::new_local(-10, project(Some(-11)));
        h.store.save(record.clone()).await.unwrap();
        h.store
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
        h.store
            .enqueue_operation(
                PendingOperation::new(
                    EntityKind::Property,
                    -11,
                    "prop",
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

        let outcome = handler
            .push(&create_op(-10, &record.uuid, Some(3)))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Success);

        let saved = h.store.get(EntityKind::Project, -10).await.unwrap().unwrap();
        let server_id = saved.server_id.unwrap();
        let on_server = h.remote.get(EntityKind::Project, server_id).await.unwrap();
        assert!(matches!(on_server.body, EntityBody::Project(ref p) if p.property_id.is_none()));

        let property_op = h
            .store
            .operation_for_entity(EntityKind::Property, -11)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            property_op.payload,
            OperationPayload::PropertyCreate(ref p) if p.project_id == server_id
        ));
    }

    #[tokio::test]
    async fn test_missing_entity_is_dropped() {
        let h = harness();
        let handler = ProjectPushHandler::new(push_context(&h));
        let outcome = handler.push(&create_op(-99, "gone", None)).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Drop(_)));
    }
}
