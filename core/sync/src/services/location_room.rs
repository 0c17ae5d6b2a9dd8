use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fieldsync_common::{EntityKind, Error, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::{LocationBody, RoomBody};
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local, synced_children};
use crate::checkpoint::{location_rooms_key, project_locations_key};
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{ensure_active, pull_collection, PullStats};

/// Locations (buildings, levels, units) and the rooms inside them.
#[derive(Clone)]
pub struct LocationRoomSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
}

impl LocationRoomSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self { ctx, processor }
    }

    pub async fn sync_locations(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::Location, Scope::Project(project_id));
        let (stats, _) =
            pull_collection(&self.ctx, query, &project_locations_key(project_id), None).await?;
        Ok(stats)
    }

    /// Pull the rooms of every synced location of a project.
    ///
    /// Each location has its own checkpoint. Cancellation is checked between
    /// locations and between pages.
    pub async fn sync_rooms(
        &self,
        project_id: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<PullStats> {
        let locations =
            synced_children(&self.ctx, EntityKind::Location, EntityKind::Project, project_id)
                .await?;

        let mut total = PullStats::default();
        for location_id in locations {
            ensure_active(cancel, "room sync")?;
            let query = ListQuery::new(EntityKind::Room, Scope::Location(location_id));
            let (stats, _) =
                pull_collection(&self.ctx, query, &location_rooms_key(location_id), cancel)
                    .await?;
            total.absorb(stats);
        }
        debug!(
            "Rooms of project {}: {} fetched, {} changed",
            project_id,
            total.fetched,
            total.changed()
        );
        Ok(total)
    }

    pub async fn create_location(&self, body: LocationBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::Location(body)).await?;
        self.processor.enqueue_location_create(&record).await?;
        Ok(record)
    }

    pub async fn update_location(&self, id: i64, body: LocationBody) -> Result<Record> {
        let (record, lock) = edit_local(&self.ctx, id, EntityBody::Location(body)).await?;
        self.processor.enqueue_location_update(&record, lock).await?;
        Ok(record)
    }

    /// Delete a location and every room in it.
    pub async fn delete_location(&self, id: i64) -> Result<()> {
        let location = self
            .ctx
            .store
            .get(EntityKind::Location, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("location {}", id)))?;
        let rooms = self
            .ctx
            .store
            .children(EntityKind::Room, EntityKind::Location, &location.known_ids())
            .await?;
        for room in rooms.into_iter().filter(|room| !room.is_deleted) {
            self.delete_room(room.id).await?;
        }

        let (record, lock) = delete_local(&self.ctx, EntityKind::Location, id).await?;
        self.processor.enqueue_location_delete(&record, lock).await?;
        Ok(())
    }

    pub async fn create_room(&self, body: RoomBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::Room(body)).await?;
        self.processor.enqueue_room_create(&record).await?;
        Ok(record)
    }

    pub async fn update_room(&self, id: i64, body: RoomBody) -> Result<Record> {
        let (record, lock) = edit_local(&self.ctx, id, EntityBody::Room(body)).await?;
        self.processor.enqueue_room_update(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_room(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Room, id).await?;
        self.processor.enqueue_room_delete(&record, lock).await?;
        Ok(())
    }
}
