use async_trait::async_trait;
use tracing::info;

use fieldsync_common::{EntityKind, Result};
use fieldsync_storage::{EntityBody, OperationPayload, OperationType, PendingOperation};

use super::{missing_locally, unsupported, waiting_for, PushContext, PushHandler};
use crate::outcome::OperationOutcome;

/// Pushes property creates, updates and deletes.
pub struct PropertyPushHandler {
    push: PushContext,
}

impl PropertyPushHandler {
    pub(crate) fn new(push: PushContext) -> Self {
        Self { push }
    }

    async fn create(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        let OperationPayload::PropertyCreate(payload) = &op.payload else {
            return Ok(unsupported(op));
        };
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let EntityBody::Property(mut body) = record.body.clone() else {
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

        let local_id = record.id;
        let saved = match self.push.create(op, record, EntityBody::Property(body)).await? {
            Ok(saved) => saved,
            Err(outcome) => return Ok(outcome),
        };

        if let Some(server_id) = saved.server_id {
            let remapped = self.push.remap.remap_property_id(local_id, server_id).await?;
            info!(
                operation_id = %op.operation_id,
                "Property {} created as {} ({} references remapped)",
                local_id,
                server_id,
                remapped.count()
            );
        }
        Ok(OperationOutcome::Success)
    }
}

#[async_trait]
impl PushHandler for PropertyPushHandler {
    fn name(&self) -> &'static str {
        "property"
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
