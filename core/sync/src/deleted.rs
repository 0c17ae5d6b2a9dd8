//! Tombstone reconciliation.
//!
//! One call per cycle asks the server which ids were deleted since the last
//! watermark and soft-deletes the matching local rows. Deleted projects
//! cascade to everything that belongs to them, queued operations included.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use fieldsync_common::time::{format_api_timestamp, parse_http_date};
use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::DeletedRecords;

use crate::checkpoint::{self, DELETED_RECORDS_KEY, SERVER_DATE_KEY};
use crate::context::SyncContext;

/// Type names requested when none are configured.
pub const DEFAULT_DELETED_TYPES: &[&str] = &[
    "projects",
    "properties",
    "photos",
    "notes",
    "rooms",
    "locations",
    "equipment",
    "damage_materials",
    "damage_material_room_logs",
    "work_scope_actions",
];

/// How far back the first reconciliation looks.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// What one reconciliation changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedSyncResult {
    /// Rows soft-deleted per entity kind, cascades included.
    pub deleted: BTreeMap<EntityKind, usize>,
    /// Server clock from the `Date` header, when present.
    pub server_date: Option<DateTime<Utc>>,
}

impl DeletedSyncResult {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// Applies server-side deletions to the local store.
#[derive(Clone)]
pub struct DeletedRecordsSyncService {
    ctx: SyncContext,
    types: Vec<String>,
    lookback: Duration,
}

impl DeletedRecordsSyncService {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            types: DEFAULT_DELETED_TYPES.iter().map(|t| t.to_string()).collect(),
            lookback: Duration::days(DEFAULT_LOOKBACK_DAYS),
        }
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Fetch and apply deletions since the last watermark.
    ///
    /// Both the watermark and the stored server clock move to the response's
    /// `Date` header. Without the header neither moves.
    pub async fn sync_deleted_records(&self) -> Result<DeletedSyncResult> {
        let now = Utc::now();
        let since = checkpoint::clamped_checkpoint(
            self.ctx.checkpoints.as_ref(),
            DELETED_RECORDS_KEY,
            now,
        )
        .await?
        .unwrap_or(now - self.lookback);

        let response = self
            .ctx
            .remote
            .deleted_records(&format_api_timestamp(&since), &self.types)
            .await?;
        let mut result = self.apply(&response.value).await?;

        match response.date_header.as_deref().and_then(parse_http_date) {
            Some(server_date) => {
                checkpoint::advance(
                    self.ctx.checkpoints.as_ref(),
                    DELETED_RECORDS_KEY,
                    Some(server_date),
                )
                .await?;
                self.ctx.checkpoints.set(SERVER_DATE_KEY, server_date).await?;
                result.server_date = Some(server_date);
            }
            None => warn!("Deleted-records response had no usable Date header; checkpoint not advanced"),
        }

        if result.total() > 0 {
            info!("Applied {} server-side deletions", result.total());
        }
        Ok(result)
    }

    async fn apply(&self, records: &DeletedRecords) -> Result<DeletedSyncResult> {
        let mut result = DeletedSyncResult::default();
        let store = &self.ctx.store;

        // Projects first so their children and queued operations go with them.
        if self.requested("projects") {
            for project_id in &records.projects {
                let removed = store.cascade_delete_project(*project_id).await?;
                *result.deleted.entry(EntityKind::Project).or_default() += removed;
            }
        }

        let mut moisture_done = false;
        for type_name in &self.types {
            let Some(kind) = DeletedRecords::kind_for_type(type_name) else {
                debug!("Ignoring unknown deleted-records type {}", type_name);
                continue;
            };
            let ids = match kind {
                EntityKind::Project => continue,
                EntityKind::MoistureLog if moisture_done => continue,
                EntityKind::MoistureLog => {
                    moisture_done = true;
                    records.all_moisture_log_ids()
                }
                _ => records.ids_for_type(type_name).to_vec(),
            };
            if ids.is_empty() {
                continue;
            }
            let removed = store.mark_deleted_by_server_ids(kind, &ids).await?;
            debug!("Deleted {} local {} rows of {} listed", removed, kind, ids.len());
            *result.deleted.entry(kind).or_default() += removed;
        }
        Ok(result)
    }

    fn requested(&self, type_name: &str) -> bool {
        self.types.iter().any(|t| t == type_name)
    }
}
