//! Entity sync services.
//!
//! Each service owns one slice of the entity graph. The pull side fetches
//! checkpointed pages and merges them into the local store; the local side
//! applies user edits to the store and queues the matching outbound
//! operation through the [`SyncQueueProcessor`].

mod equipment;
mod location_room;
mod moisture;
mod note;
mod photo;
mod project;
mod property;
mod support;
mod work_scope;

pub use equipment::EquipmentSyncService;
pub use location_room::LocationRoomSyncService;
pub use moisture::MoistureLogSyncService;
pub use note::{NoteSyncService, DEFAULT_NOTES_PAGE_LIMIT};
pub use photo::PhotoSyncService;
pub use project::ProjectSyncService;
pub use property::PropertySyncService;
pub use support::SupportSyncService;
pub use work_scope::WorkScopeSyncService;

use tracing::warn;

use fieldsync_common::{EntityKind, Error, Result};
use fieldsync_storage::{EntityBody, Record};

use crate::context::SyncContext;
use crate::processor::observed_lock;

/// Store a record created on this device under a fresh local id.
///
/// The generator starts fresh on every launch, so an id already held by a
/// stored row (device clock set back) moves it past the lowest stored id.
pub(crate) async fn insert_local(ctx: &SyncContext, body: EntityBody) -> Result<Record> {
    let kind = body.kind();
    let mut id = ctx.ids.next_id();
    if ctx.store.get(kind, id).await?.is_some() {
        let lowest = ctx
            .store
            .list(kind)
            .await?
            .iter()
            .map(|record| record.id)
            .min()
            .unwrap_or(id);
        warn!(
            entity_type = %kind,
            entity_id = id,
            "Local id already in use; continuing below {}",
            lowest
        );
        ctx.ids.advance_past(lowest);
        id = ctx.ids.next_id();
    }
    let record = Record::new_local(id, body);
    ctx.store.save(record.clone()).await?;
    Ok(record)
}

async fn load_live(ctx: &SyncContext, kind: EntityKind, id: i64) -> Result<Record> {
    match ctx.store.get(kind, id).await? {
        Some(record) if !record.is_deleted => Ok(record),
        _ => Err(Error::NotFound(format!("{} {}", kind, id))),
    }
}

/// Replace a record's body as a local edit.
///
/// Returns the saved record and the lock token observed before the edit.
///
/// # Errors
/// - `NotFound` if the record is missing or deleted
/// - `InvalidInput` if the body is of another kind
pub(crate) async fn edit_local(
    ctx: &SyncContext,
    id: i64,
    body: EntityBody,
) -> Result<(Record, Option<String>)> {
    let kind = body.kind();
    let mut record = load_live(ctx, kind, id).await?;
    let lock = observed_lock(&record);
    record.body = body;
    record.touch();
    ctx.store.save(record.clone()).await?;
    Ok((record, lock))
}

/// Soft-delete a record as a local edit.
pub(crate) async fn delete_local(
    ctx: &SyncContext,
    kind: EntityKind,
    id: i64,
) -> Result<(Record, Option<String>)> {
    let mut record = load_live(ctx, kind, id).await?;
    let lock = observed_lock(&record);
    record.is_deleted = true;
    record.touch();
    ctx.store.save(record.clone()).await?;
    Ok((record, lock))
}

/// Server ids of the live local children of a parent, for per-parent pulls.
pub(crate) async fn synced_children(
    ctx: &SyncContext,
    kind: EntityKind,
    parent: EntityKind,
    parent_id: i64,
) -> Result<Vec<i64>> {
    let mut ids: Vec<i64> = ctx
        .store
        .children(kind, parent, &[parent_id])
        .await?
        .into_iter()
        .filter(|record| !record.is_deleted)
        .filter_map(|record| record.server_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
