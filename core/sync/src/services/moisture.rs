use std::sync::Arc;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::{AtmosphericLogBody, MoistureLogBody};
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local};
use crate::checkpoint::{project_atmospheric_logs_key, project_moisture_logs_key};
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{pull_collection, PullStats};

/// Moisture readings on materials and atmospheric readings per room.
#[derive(Clone)]
pub struct MoistureLogSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl MoistureLogSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    pub async fn sync_project_moisture_logs(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::MoistureLog, Scope::Project(project_id));
        let (stats, _) =
            pull_collection(&self.ctx, query, &project_moisture_logs_key(project_id), None)
                .await?;
        Ok(stats)
    }

    pub async fn sync_project_atmospheric_logs(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::AtmosphericLog, Scope::Project(project_id));
        let (stats, _) = pull_collection(
            &self.ctx,
            query,
            &project_atmospheric_logs_key(project_id),
            None,
        )
        .await?;
        Ok(stats)
    }

    async fn store_upsert(&self, id: Option<i64>, body: EntityBody) -> Result<(Record, Option<String>)> {
        match id {
            Some(id) => edit_local(&self.ctx, id, body).await,
            None => Ok((insert_local(&self.ctx, body).await?, None)),
        }
    }

    pub async fn upsert_moisture_log(&self, id: Option<i64>, body: MoistureLogBody) -> Result<Record> {
        let (record, lock) = self.store_upsert(id, EntityBody::MoistureLog(body)).await?;
        self.processor.enqueue_moisture_log_upsert(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_moisture_log(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::MoistureLog, id).await?;
        self.processor.enqueue_moisture_log_delete(&record, lock).await?;
        Ok(())
    }

    pub async fn upsert_atmospheric_log(
        &self,
        id: Option<i64>,
        body: AtmosphericLogBody,
    ) -> Result<Record> {
        let (record, lock) = self.store_upsert(id, EntityBody::AtmosphericLog(body)).await?;
        self.processor
            .enqueue_atmospheric_log_upsert(&record, lock)
            .await?;
        Ok(record)
    }

    pub async fn delete_atmospheric_log(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::AtmosphericLog, id).await?;
        self.processor
            .enqueue_atmospheric_log_delete(&record, lock)
            .await?;
        Ok(())
    }
}
