use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::ProjectBody;
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local};
use crate::checkpoint::{company_projects_key, user_projects_key};
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{pull_collection, PullStats};

/// Project lists and project mutations.
#[derive(Clone)]
pub struct ProjectSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl ProjectSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    /// Pull the projects of a company.
    ///
    /// A forced full pull ignores the checkpoint and afterwards removes
    /// clean local projects of the company that the server no longer lists,
    /// together with everything that belongs to them.
    pub async fn sync_company_projects(
        &self,
        company_id: i64,
        assigned_only: bool,
        force_full: bool,
    ) -> Result<PullStats> {
        let key = company_projects_key(company_id, assigned_only);
        if force_full {
            self.ctx.checkpoints.clear(&key).await?;
        }

        let query = ListQuery::new(
            EntityKind::Project,
            Scope::Company {
                company_id,
                assigned_only,
            },
        );
        let (stats, records) = pull_collection(&self.ctx, query, &key, None).await?;

        if force_full {
            let listed: HashSet<i64> = records.iter().map(|r| r.id).collect();
            let removed = self
                .remove_stale_projects(company_id, assigned_only, &listed)
                .await?;
            if removed > 0 {
                info!(
                    "Removed {} projects of company {} no longer on the server",
                    removed, company_id
                );
            }
        }
        Ok(stats)
    }

    async fn remove_stale_projects(
        &self,
        company_id: i64,
        assigned_only: bool,
        listed: &HashSet<i64>,
    ) -> Result<usize> {
        let mut removed = 0;
        for record in self.ctx.store.list(EntityKind::Project).await? {
            let EntityBody::Project(body) = &record.body else {
                continue;
            };
            let Some(server_id) = record.server_id else {
                continue;
            };
            let in_scope = body.company_id == Some(company_id)
                && (!assigned_only || !body.assigned_user_ids.is_empty());
            if !in_scope || record.is_dirty || record.is_deleted || listed.contains(&server_id) {
                continue;
            }
            removed += self.ctx.store.cascade_delete_project(server_id).await?;
        }
        Ok(removed)
    }

    /// Pull the projects assigned to a user.
    pub async fn sync_user_projects(&self, user_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::Project, Scope::User { user_id });
        let (stats, _) =
            pull_collection(&self.ctx, query, &user_projects_key(user_id), None).await?;
        Ok(stats)
    }

    pub async fn create_project(&self, body: ProjectBody) -> Result<Record> {
        let company_id = body.company_id;
        let record = insert_local(&self.ctx, EntityBody::Project(body)).await?;
        self.processor
            .enqueue_project_create(&record, company_id)
            .await?;
        Ok(record)
    }

    pub async fn update_project(&self, id: i64, body: ProjectBody) -> Result<Record> {
        let (record, lock) = edit_local(&self.ctx, id, EntityBody::Project(body)).await?;
        self.processor.enqueue_project_update(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_project(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Project, id).await?;
        self.processor.enqueue_project_delete(&record, lock).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::services::tests::processor;
    use fieldsync_storage::{CheckpointStore, LocalStore, OperationType};

    fn project(company_id: i64, title: &str) -> ProjectBody {
        ProjectBody {
            company_id: Some(company_id),
            title: title.to_string(),
            status: "active".to_string(),
            property_id: None,
            assigned_user_ids: vec![9],
        }
    }

    #[tokio::test]
    async fn test_company_pull_is_incremental() {
        let h = harness();
        let service = ProjectSyncService::new(h.ctx.clone(), processor(&h));
        h.remote.seed(EntityBody::Project(project(4, "Kitchen flood")));
        h.remote.seed(EntityBody::Project(project(5, "Other company")));

        let first = service.sync_company_projects(4, false, false).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert!(h.checkpoints.get("company_projects_4").await.unwrap().is_some());

        h.remote.seed(EntityBody::Project(project(4, "Roof leak")));
        let second = service.sync_company_projects(4, false, false).await.unwrap();
        assert_eq!(second.inserted, 1);
        assert_eq!(h.store.list(EntityKind::Project).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_full_pull_removes_projects_gone_from_server() {
        let h = harness();
        let service = ProjectSyncService::new(h.ctx.clone(), processor(&h));
        let kept = h.remote.seed(EntityBody::Project(project(4, "Kept")));
        let gone = h.remote.seed(EntityBody::Project(project(4, "Gone")));
        service.sync_company_projects(4, false, false).await.unwrap();
        h.remote.remove(EntityKind::Project, gone.id);

        service.sync_company_projects(4, false, true).await.unwrap();

        let kept = h.store.get(EntityKind::Project, kept.id).await.unwrap().unwrap();
        let gone = h.store.get(EntityKind::Project, gone.id).await.unwrap().unwrap();
        assert!(!kept.is_deleted);
        assert!(gone.is_deleted);
    }

    #[tokio::test]
    async fn test_local_project_lifecycle() {
        let h = harness();
        let service = ProjectSyncService::new(h.ctx.clone(), processor(&h));

        let record = service.create_project(project(4, "Draft")).await.unwrap();
        assert!(record.id < 0);
        let op = h
            .store
            .operation_for_entity(EntityKind::Project, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.operation_type, OperationType::Create);

        service
            .update_project(record.id, project(4, "Renamed"))
            .await
            .unwrap();
        let op = h
            .store
            .operation_for_entity(EntityKind::Project, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.operation_type, OperationType::Create);

        service.delete_project(record.id).await.unwrap();
        assert!(h.store.operations().await.unwrap().is_empty());
    }
}
