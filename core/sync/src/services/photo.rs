use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};

use super::{delete_local, synced_children};
use crate::checkpoint::room_photos_key;
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{ensure_active, pull_collection, PullStats};

/// Photo metadata. Uploads happen elsewhere; only deletes are pushed from here.
#[derive(Clone)]
pub struct PhotoSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl PhotoSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    /// Pull the photos of one room, keyed by the room's server id.
    pub async fn sync_room_photos(
        &self,
        project_id: i64,
        room_id: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<PullStats> {
        ensure_active(cancel, "photo sync")?;
        let query = ListQuery::new(EntityKind::Photo, Scope::Room(room_id));
        let (stats, records) =
            pull_collection(&self.ctx, query, &room_photos_key(room_id), cancel).await?;
        debug!(
            "Project {} room {}: {} photos",
            project_id,
            room_id,
            records.len()
        );
        Ok(stats)
    }

    /// Pull the photos of every synced room of a project.
    pub async fn sync_project_photos(
        &self,
        project_id: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<PullStats> {
        let rooms =
            synced_children(&self.ctx, EntityKind::Room, EntityKind::Project, project_id).await?;
        let mut total = PullStats::default();
        for room_id in rooms {
            total.absorb(self.sync_room_photos(project_id, room_id, cancel).await?);
        }
        Ok(total)
    }

    pub async fn delete_photo(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Photo, id).await?;
        self.processor.enqueue_photo_delete(&record, lock).await?;
        Ok(())
    }
}
