use std::sync::Arc;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::EquipmentBody;
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local};
use crate::checkpoint::project_equipment_key;
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{pull_collection, PullStats};

/// Drying equipment placed in rooms.
#[derive(Clone)]
pub struct EquipmentSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl EquipmentSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    pub async fn sync_project_equipment(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::Equipment, Scope::Project(project_id));
        let (stats, _) =
            pull_collection(&self.ctx, query, &project_equipment_key(project_id), None).await?;
        Ok(stats)
    }

    /// Create equipment (`id == None`) or edit an existing row.
    pub async fn upsert_equipment(&self, id: Option<i64>, body: EquipmentBody) -> Result<Record> {
        let (record, lock) = match id {
            Some(id) => edit_local(&self.ctx, id, EntityBody::Equipment(body)).await?,
            None => (insert_local(&self.ctx, EntityBody::Equipment(body)).await?, None),
        };
        self.processor.enqueue_equipment_upsert(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_equipment(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Equipment, id).await?;
        self.processor.enqueue_equipment_delete(&record, lock).await?;
        Ok(())
    }
}
