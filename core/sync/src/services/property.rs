use std::sync::Arc;
use tracing::debug;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::PropertyBody;
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local};
use crate::checkpoint::project_property_key;
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{pull_collection, PullStats};

/// The property (address) attached to a project.
#[derive(Clone)]
pub struct PropertySyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl PropertySyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    /// Pull a project's property and link it from a clean local project.
    pub async fn sync_project_property(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::Property, Scope::Project(project_id));
        let (stats, records) =
            pull_collection(&self.ctx, query, &project_property_key(project_id), None).await?;

        if let Some(property) = records.iter().max_by_key(|r| r.updated_at) {
            if let Some(mut project) = self.ctx.store.resolve(EntityKind::Project, project_id).await? {
                if let EntityBody::Project(body) = &mut project.body {
                    if !project.is_dirty && body.property_id != Some(property.id) {
                        debug!("Linking project {} to property {}", project_id, property.id);
                        body.property_id = Some(property.id);
                        self.ctx.store.save(project).await?;
                    }
                }
            }
        }
        Ok(stats)
    }

    pub async fn create_property(&self, body: PropertyBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::Property(body)).await?;
        self.processor.enqueue_property_create(&record).await?;
        Ok(record)
    }

    pub async fn update_property(&self, id: i64, body: PropertyBody) -> Result<Record> {
        let (record, lock) = edit_local(&self.ctx, id, EntityBody::Property(body)).await?;
        self.processor.enqueue_property_update(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_property(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Property, id).await?;
        self.processor.enqueue_property_delete(&record, lock).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::pull::merge_remote_record;
    use crate::services::tests::processor;
    use fieldsync_storage::model::ProjectBody;
    use fieldsync_storage::{LocalStore, OperationPayload};

    #[tokio::test]
    async fn test_pull_links_property_to_project() {
        let h = harness();
        let service = PropertySyncService::new(h.ctx.clone(), processor(&h));
        let project = h.remote.seed(EntityBody::Project(ProjectBody {
            company_id: Some(1),
            title: "Basement".to_string(),
            status: "active".to_string(),
            property_id: None,
            assigned_user_ids: vec![],
        }));
        merge_remote_record(h.store.as_ref(), project.clone()).await.unwrap();
        let property = h.remote.seed(EntityBody::Property(PropertyBody {
            project_id: project.id,
            address: "12 Elm St".to_string(),
            city: None,
        }));

        let stats = service.sync_project_property(project.id).await.unwrap();
        assert_eq!(stats.inserted, 1);
        let local = h.store.get(EntityKind::Project, project.id).await.unwrap().unwrap();
        assert_eq!(local.body.reference(EntityKind::Property), Some(property.id));
    }

    #[tokio::test]
    async fn test_update_carries_project_and_lock() {
        let h = harness();
        let service = PropertySyncService::new(h.ctx.clone(), processor(&h));
        let remote = h.remote.seed(EntityBody::Property(PropertyBody {
            project_id: 30,
            address: "1 Main".to_string(),
            city: None,
        }));
        merge_remote_record(h.store.as_ref(), remote.clone()).await.unwrap();

        service
            .update_property(
                remote.id,
                PropertyBody {
                    project_id: 30,
                    address: "1 Main St".to_string(),
                    city: Some("Dayton".to_string()),
                },
            )
            .await
            .unwrap();

        let op = h
            .store
            .operation_for_entity(EntityKind::Property, remote.id)
            .await
            .unwrap()
            .unwrap();
        match op.payload {
            OperationPayload::PropertyUpdate(payload) => {
                assert_eq!(payload.project_id, 30);
                assert_eq!(
                    payload.lock_updated_at,
                    Some(fieldsync_common::time::format_api_timestamp(&remote.updated_at))
                );
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
