use futures::future::join_all;
use tracing::{debug, warn};

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};

use super::synced_children;
use crate::checkpoint::{project_damages_key, room_work_scopes_key};
use crate::context::SyncContext;
use crate::pull::{pull_collection, PullStats};

/// Damaged materials and the work-scope line items that address them.
///
/// Both are read-only on this device.
#[derive(Clone)]
pub struct WorkScopeSyncService {
    ctx: SyncContext,
}

impl WorkScopeSyncService {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn sync_project_damages(&self, project_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::Damage, Scope::Project(project_id));
        let (stats, _) =
            pull_collection(&self.ctx, query, &project_damages_key(project_id), None).await?;
        Ok(stats)
    }

    pub async fn sync_room_work_scopes(&self, room_id: i64) -> Result<PullStats> {
        let query = ListQuery::new(EntityKind::WorkScope, Scope::Room(room_id));
        let (stats, _) =
            pull_collection(&self.ctx, query, &room_work_scopes_key(room_id), None).await?;
        Ok(stats)
    }

    /// Pull the work scopes of every synced room of a project concurrently.
    ///
    /// Rooms that fail are logged and skipped; the first error is returned
    /// after every room has been attempted.
    pub async fn sync_work_scopes_for_project(&self, project_id: i64) -> Result<PullStats> {
        let rooms =
            synced_children(&self.ctx, EntityKind::Room, EntityKind::Project, project_id).await?;
        let results = join_all(rooms.iter().map(|room_id| self.sync_room_work_scopes(*room_id))).await;

        let mut total = PullStats::default();
        let mut first_error = None;
        for (room_id, result) in rooms.iter().zip(results) {
            match result {
                Ok(stats) => total.absorb(stats),
                Err(err) => {
                    warn!("Work scopes for room {} failed: {}", room_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        debug!(
            "Work scopes of project {}: {} rooms, {} records",
            project_id,
            rooms.len(),
            total.fetched
        );
        Ok(total)
    }
}
