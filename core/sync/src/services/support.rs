use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::{SupportConversationBody, SupportMessageBody};
use fieldsync_storage::{EntityBody, Record};

use super::insert_local;
use crate::checkpoint::{support_conversations_key, support_messages_key};
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{fetch_all_pages, merge_remote_record, pull_collection, PullStats};

/// Support categories, conversations and messages.
#[derive(Clone)]
pub struct SupportSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl SupportSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    /// Replace the local category list with the server's.
    pub async fn sync_categories(&self) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::SupportCategory, Scope::Global);
        let categories = fetch_all_pages(
            |page| {
                let remote = self.ctx.remote.clone();
                let query = query.page(page);
                async move { remote.list(&query).await }
            },
            None,
        )
        .await?;

        let listed: HashSet<i64> = categories.iter().map(|c| c.id).collect();
        let mut stats = PullStats::default();
        for category in categories {
            stats.record(merge_remote_record(self.ctx.store.as_ref(), category).await?);
        }

        let mut purged = 0;
        for local in self.ctx.store.list(EntityKind::SupportCategory).await? {
            if !local.server_id.map_or(false, |id| listed.contains(&id)) {
                self.ctx
                    .store
                    .purge(EntityKind::SupportCategory, local.id)
                    .await?;
                purged += 1;
            }
        }
        debug!("Support categories: {} listed, {} purged", listed.len(), purged);
        Ok(stats)
    }

    pub async fn sync_conversations(&self, user_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(
            EntityKind::SupportConversation,
            Scope::User { user_id },
        );
        let (stats, _) =
            pull_collection(&self.ctx, query, &support_conversations_key(user_id), None).await?;
        Ok(stats)
    }

    pub async fn sync_messages(&self, conversation_server_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(
            EntityKind::SupportMessage,
            Scope::Conversation(conversation_server_id),
        );
        let (stats, _) = pull_collection(
            &self.ctx,
            query,
            &support_messages_key(conversation_server_id),
            None,
        )
        .await?;
        Ok(stats)
    }

    /// Open a conversation offline. It is created on the next drain.
    pub async fn create_conversation(&self, body: SupportConversationBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::SupportConversation(body)).await?;
        self.processor
            .enqueue_support_conversation_create(&record)
            .await?;
        Ok(record)
    }

    /// Post a message offline.
    ///
    /// A message in a conversation that has no server id yet waits for it.
    pub async fn send_message(&self, body: SupportMessageBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::SupportMessage(body)).await?;
        self.processor.enqueue_support_message_create(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::services::tests::processor;
    use fieldsync_storage::model::SupportCategoryBody;
    use fieldsync_storage::LocalStore;

    fn category(name: &str) -> EntityBody {
        EntityBody::SupportCategory(SupportCategoryBody {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_categories_are_replaced() {
        let h = harness();
        let service = SupportSyncService::new(h.ctx.clone(), processor(&h));
        let billing = h.remote.seed(category("Billing"));
        h.remote.seed(category("Bugs"));
        service.sync_categories().await.unwrap();
        assert_eq!(h.store.list(EntityKind::SupportCategory).await.unwrap().len(), 2);

        h.remote.remove(EntityKind::SupportCategory, billing.id);
        service.sync_categories().await.unwrap();

        let remaining = h.store.list(EntityKind::SupportCategory).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(remaining[0].body, EntityBody::SupportCategory(ref c) if c.name == "Bugs"));
    }

    #[tokio::test]
    async fn test_offline_message_waits_for_conversation() {
        let h = harness();
        let p = processor(&h);
        let service = SupportSyncService::new(h.ctx.clone(), p.clone());
        let conversation = service
            .create_conversation(SupportConversationBody {
                category_id: None,
                subject: "Sync stuck".to_string(),
                status: "open".to_string(),
            })
            .await
            .unwrap();
        service
            .send_message(SupportMessageBody {
                conversation_id: conversation.id,
                body: "Queue shows 4 pending".to_string(),
                sender_id: None,
            })
            .await
            .unwrap();

        // Same priority; the conversation was queued first, so one drain pushes both.
        let result = p.process_pending_operations().await.unwrap();
        assert_eq!(result.metrics.successes, 2);
        let server_conversation = h
            .store
            .get(EntityKind::SupportConversation, conversation.id)
            .await
            .unwrap()
            .unwrap()
            .server_id
            .unwrap();
        assert_eq!(
            h.remote.records(EntityKind::SupportMessage)[0]
                .body
                .reference(EntityKind::SupportConversation),
            Some(server_conversation)
        );
    }
}
