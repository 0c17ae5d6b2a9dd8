//! Inbound helpers shared by the entity sync services.

use chrono::{DateTime, Utc};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use fieldsync_common::{Error, Result};
use fieldsync_remote::{ApiResult, ListQuery, Page, RemoteRecord};
use fieldsync_storage::{LocalStore, Record, SyncStatus};

use crate::checkpoint;
use crate::context::SyncContext;

/// Fail with `Cancelled` if the token has fired.
pub fn ensure_active(cancel: Option<&CancellationToken>, what: &str) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Error::Cancelled(what.to_string())),
        _ => Ok(()),
    }
}

/// Fetch every page of a paginated endpoint, starting at page 1.
///
/// Stops when the reported current page reaches the last page, when a page
/// comes back empty, or when metadata is missing. The cancellation token is
/// checked before every page.
pub async fn fetch_all_pages<T, F, Fut>(
    mut fetch: F,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ApiResult<Page<T>>>,
{
    let mut page = 1u32;
    let mut all = Vec::new();

    loop {
        ensure_active(cancel, "pagination")?;
        let response = fetch(page).await?;
        let meta = response.meta.unwrap_or_default();
        let current = meta.current_page.unwrap_or(page);
        let last = meta.last_page.unwrap_or(current);
        let empty = response.data.is_empty();
        all.extend(response.data);

        if current >= last || empty {
            break;
        }
        page = (current + 1).max(page + 1);
    }

    Ok(all)
}

/// What merging one server record did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Local unsynced edits or a local delete take precedence.
    KeptLocal,
}

/// Counts for one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub kept_local: usize,
}

impl PullStats {
    pub fn record(&mut self, outcome: MergeOutcome) {
        self.fetched += 1;
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::KeptLocal => self.kept_local += 1,
        }
    }

    pub fn absorb(&mut self, other: PullStats) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.kept_local += other.kept_local;
    }

    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Merge one server record into the local store.
///
/// Existing rows are matched by server id, then by uuid. A match keeps its
/// local id, uuid and creation time; only server-owned fields are replaced.
/// Rows with unsynced local edits or a local delete are left alone. New rows
/// use the server id as their local id.
pub async fn merge_remote_record(
    store: &dyn LocalStore,
    remote: RemoteRecord,
) -> Result<MergeOutcome> {
    let kind = remote.body.kind();
    let mut existing = store.get_by_server_id(kind, remote.id).await?;
    if existing.is_none() {
        if let Some(uuid) = remote.uuid.as_deref() {
            existing = store.get_by_uuid(kind, uuid).await?;
        }
    }

    let now = Utc::now();
    match existing {
        Some(local) if local.is_dirty || local.is_deleted => {
            debug!(
                entity_type = %kind,
                entity_id = local.id,
                "Keeping local version over server record {}",
                remote.id
            );
            Ok(MergeOutcome::KeptLocal)
        }
        Some(mut local) => {
            local.server_id = Some(remote.id);
            local.body = remote.body;
            local.updated_at = remote.updated_at;
            local.last_synced_at = Some(now);
            local.sync_status = SyncStatus::Synced;
            local.is_dirty = false;
            store.save(local).await?;
            Ok(MergeOutcome::Updated)
        }
        None => {
            let record = Record {
                id: remote.id,
                server_id: Some(remote.id),
                uuid: remote.uuid.unwrap_or_else(|| Uuid::new_v4().to_string()),
                created_at: remote.created_at,
                updated_at: remote.updated_at,
                last_synced_at: Some(now),
                sync_status: SyncStatus::Synced,
                is_dirty: false,
                is_deleted: false,
                body: remote.body,
            };
            store.save(record).await?;
            Ok(MergeOutcome::Inserted)
        }
    }
}

/// Latest `updated_at` among server records.
pub fn max_updated_at(records: &[RemoteRecord]) -> Option<DateTime<Utc>> {
    records.iter().map(|r| r.updated_at).max()
}

/// Pull one checkpointed collection end to end.
///
/// Reads (and clamps) the checkpoint, fetches all pages updated since it,
/// merges each record and advances the checkpoint to the newest
/// `updated_at` seen. Returns the stats and the fetched records.
pub async fn pull_collection(
    ctx: &SyncContext,
    query: ListQuery,
    checkpoint_key: &str,
    cancel: Option<&CancellationToken>,
) -> Result<(PullStats, Vec<RemoteRecord>)> {
    let since = checkpoint::since_param(ctx.checkpoints.as_ref(), checkpoint_key).await?;
    let query = query.updated_since(since);

    let records = fetch_all_pages(
        |page| {
            let remote = ctx.remote.clone();
            let query = query.page(page);
            async move { remote.list(&query).await }
        },
        cancel,
    )
    .await?;

    let mut stats = PullStats::default();
    for record in &records {
        stats.record(merge_remote_record(ctx.store.as_ref(), record.clone()).await?);
    }

    checkpoint::advance(
        ctx.checkpoints.as_ref(),
        checkpoint_key,
        max_updated_at(&records),
    )
    .await?;

    debug!(
        checkpoint = checkpoint_key,
        "Pulled {} records ({} new, {} updated, {} kept local)",
        stats.fetched,
        stats.inserted,
        stats.updated,
        stats.kept_local
    );
    Ok((stats, records))
}
