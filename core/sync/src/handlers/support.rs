use async_trait::async_trait;
use tracing::debug;

use fieldsync_common::{EntityKind, Result};
use fieldsync_storage::{OperationType, PendingOperation};

use super::{missing_locally, unsupported, PushContext, PushHandler};
use crate::outcome::OperationOutcome;

/// Support conversations and messages. Both are create-only.
pub struct SupportPushHandler {
    push: PushContext,
}

impl SupportPushHandler {
    pub(crate) fn new(push: PushContext) -> Self {
        Self { push }
    }
}

#[async_trait]
impl PushHandler for SupportPushHandler {
    fn name(&self) -> &'static str {
        "support"
    }

    async fn push(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        if op.operation_type != OperationType::Create {
            return Ok(unsupported(op));
        }
        let Some(record) = self.push.load(op).await? else {
            return Ok(missing_locally(op));
        };
        let body = match self.push.resolve_body(&record.body).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };

        let local_id = record.id;
        let saved = match self.push.create(op, record, body).await? {
            Ok(saved) => saved,
            Err(outcome) => return Ok(outcome),
        };

        if op.entity_type == EntityKind::SupportConversation {
            if let Some(server_id) = saved.server_id {
                let remapped = self
                    .push
                    .remap
                    .remap_conversation_id(local_id, server_id)
                    .await?;
                debug!(
                    "Conversation {} created as {}; {} messages repointed",
                    local_id,
                    server_id,
                    remapped.count()
                );
            }
        }
        Ok(OperationOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::handlers::tests::push_context;
    use fieldsync_storage::model::{SupportConversationBody, SupportMessageBody};
    use fieldsync_storage::{EntityBody, LocalStore, OperationPayload, OperationPriority, Record};

    fn create(kind: EntityKind, id: i64) -> PendingOperation {
        PendingOperation::new(
            kind,
            id,
            format!("{}-uuid", id),
            OperationType::Create,
            OperationPayload::create(format!("{}-key", id)),
            OperationPriority::Low,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_message_follows_its_conversation() {
        let h = harness();
        h.store
            .save(Record::new_local(
                -1,
                EntityBody::SupportConversation(SupportConversationBody {
                    category_id: None,
                    subject: "App crashes on upload".to_string(),
                    status: "open".to_string(),
                }),
            ))
            .await
            .unwrap();
        h.store
            .save(Record::new_local(
                -2,
                EntityBody::SupportMessage(SupportMessageBody {
                    conversation_id: -1,
                    body: "Happens with large photos".to_string(),
                    sender_id: Some(9),
                }),
            ))
            .await
            .unwrap();
        let handler = SupportPushHandler::new(push_context(&h));

        let early = handler.push(&create(EntityKind::SupportMessage, -2)).await.unwrap();
        assert_eq!(
            early,
            OperationOutcome::Skip("waiting for support_conversation -1 to sync".to_string())
        );

        let conversation = handler
            .push(&create(EntityKind::SupportConversation, -1))
            .await
            .unwrap();
        assert_eq!(conversation, OperationOutcome::Success);

        let message = h.store.get(EntityKind::SupportMessage, -2).await.unwrap().unwrap();
        let server_conversation = h
            .store
            .get(EntityKind::SupportConversation, -1)
            .await
            .unwrap()
            .unwrap()
            .server_id;
        assert_eq!(
            message.body.reference(EntityKind::SupportConversation),
            server_conversation
        );

        let late = handler.push(&create(EntityKind::SupportMessage, -2)).await.unwrap();
        assert_eq!(late, OperationOutcome::Success);
    }
}
