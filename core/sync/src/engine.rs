//! Core sync engine that orchestrates push, reconciliation and pull.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldsync_common::{Error, Result};

use crate::context::SyncContext;
use crate::deleted::{DeletedRecordsSyncService, DeletedSyncResult, DEFAULT_DELETED_TYPES};
use crate::metadata::{MetadataSyncResult, ProjectMetadataSyncService};
use crate::outcome::PendingOperationResult;
use crate::processor::SyncQueueProcessor;
use crate::pull::PullStats;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;
use crate::services::{
    EquipmentSyncService, LocationRoomSyncService, MoistureLogSyncService, NoteSyncService,
    PhotoSyncService, ProjectSyncService, PropertySyncService, SupportSyncService,
    WorkScopeSyncService, DEFAULT_NOTES_PAGE_LIMIT,
};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Handler errors tolerated per operation.
    pub max_retries: u32,
    /// Dependency skips tolerated per operation.
    pub max_skips: u32,
    pub retry_base_secs: u64,
    pub skip_base_secs: u64,
    /// Cap for both backoff ladders.
    pub max_backoff_secs: u64,
    pub sync_mode: SyncMode,
    /// First deleted-records call looks this far back.
    pub deleted_records_lookback_days: i64,
    pub deleted_record_types: Vec<String>,
    pub notes_page_limit: u32,
    /// Company whose projects the cycle pulls.
    pub company_id: Option<i64>,
    /// User whose assigned projects and support threads the cycle pulls.
    pub user_id: Option<i64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_skips: 10,
            retry_base_secs: 10,
            skip_base_secs: 30,
            max_backoff_secs: 30 * 60,
            sync_mode: SyncMode::Manual,
            deleted_records_lookback_days: 30,
            deleted_record_types: DEFAULT_DELETED_TYPES.iter().map(|t| t.to_string()).collect(),
            notes_page_limit: DEFAULT_NOTES_PAGE_LIMIT,
            company_id: None,
            user_id: None,
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::InvalidInput(format!(
                "invalid sync config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_max_skips(self.max_skips)
            .with_retry_base_delay(Duration::from_secs(self.retry_base_secs))
            .with_skip_base_delay(Duration::from_secs(self.skip_base_secs))
            .with_max_delay(Duration::from_secs(self.max_backoff_secs))
    }
}

/// What one engine call did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// The network was down; nothing was attempted.
    pub offline: bool,
    /// Failed operations reset before pushing.
    pub retried: usize,
    pub push: PendingOperationResult,
    pub deleted: Option<DeletedSyncResult>,
    /// Pull counts by collection name.
    pub pulled: BTreeMap<String, PullStats>,
    pub metadata: Option<MetadataSyncResult>,
    /// Phases that failed, with their error. Later phases still run.
    pub errors: Vec<String>,
    /// Earliest backoff expiry left in the queue.
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.metadata.as_ref().map_or(true, |m| m.is_success())
    }

    pub fn summary(&self) -> String {
        if self.offline {
            return "offline, nothing synced".to_string();
        }
        let mut out = format!(
            "pushed {} (ok={}, fail={}, skip={}, conflict={})",
            self.push.metrics.total,
            self.push.metrics.successes,
            self.push.metrics.failures,
            self.push.metrics.skips,
            self.push.metrics.conflicts
        );
        if self.retried > 0 {
            let _ = write!(out, ", reset {} failed", self.retried);
        }
        if let Some(deleted) = &self.deleted {
            let _ = write!(out, ", deleted {}", deleted.total());
        }
        for (name, stats) in &self.pulled {
            let _ = write!(out, ", {} {}/{}", name, stats.changed(), stats.fetched);
        }
        if let Some(metadata) = &self.metadata {
            let total = metadata.total();
            let _ = write!(
                out,
                ", metadata {}/{} in {} waves",
                total.changed(),
                total.fetched,
                metadata.report.waves
            );
        }
        if !self.errors.is_empty() {
            let _ = write!(out, ", {} errors", self.errors.len());
        }
        out
    }

    fn record_pull(&mut self, name: &str, result: Result<PullStats>) {
        match result {
            Ok(stats) => {
                self.pulled.insert(name.to_string(), stats);
            }
            Err(e) => self.record_error(name, e),
        }
    }

    fn record_error(&mut self, phase: &str, error: Error) {
        warn!("Sync phase {} failed: {}", phase, error);
        self.errors.push(format!("{}: {}", phase, error));
    }
}

/// Main sync engine. Owns the queue processor and every entity service.
pub struct SyncEngine {
    ctx: SyncContext,
    config: SyncConfig,
    processor: Arc<SyncQueueProcessor>,
    projects: ProjectSyncService,
    properties: PropertySyncService,
    locations: LocationRoomSyncService,
    notes: NoteSyncService,
    equipment: EquipmentSyncService,
    moisture: MoistureLogSyncService,
    photos: PhotoSyncService,
    work_scopes: WorkScopeSyncService,
    support: SupportSyncService,
    deleted: DeletedRecordsSyncService,
    metadata: ProjectMetadataSyncService,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext, config: SyncConfig) -> Result<Self> {
        let processor = Arc::new(SyncQueueProcessor::new(ctx.clone(), config.retry_config())?);
        let notes = NoteSyncService::new(ctx.clone(), processor.clone())
            .with_page_limit(config.notes_page_limit);
        let equipment = EquipmentSyncService::new(ctx.clone(), processor.clone());
        let moisture = MoistureLogSyncService::new(ctx.clone(), processor.clone());
        let work_scopes = WorkScopeSyncService::new(ctx.clone());
        let metadata = ProjectMetadataSyncService::new(
            notes.clone(),
            equipment.clone(),
            moisture.clone(),
            work_scopes.clone(),
        );
        let deleted = DeletedRecordsSyncService::new(ctx.clone())
            .with_types(config.deleted_record_types.clone())
            .with_lookback(chrono::Duration::days(config.deleted_records_lookback_days));

        Ok(Self {
            projects: ProjectSyncService::new(ctx.clone(), processor.clone()),
            properties: PropertySyncService::new(ctx.clone(), processor.clone()),
            locations: LocationRoomSyncService::new(ctx.clone(), processor.clone()),
            photos: PhotoSyncService::new(ctx.clone(), processor.clone()),
            support: SupportSyncService::new(ctx.clone(), processor.clone()),
            notes,
            equipment,
            moisture,
            work_scopes,
            deleted,
            metadata,
            processor,
            config,
            ctx,
        })
    }

    /// Push pending operations, apply server deletions, pull the project list.
    pub async fn sync_cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.ctx.is_online() {
            debug!("Sync cycle skipped: offline");
            report.offline = true;
            report.next_scheduled_at = self.ctx.store.next_scheduled_at().await?;
            return Ok(report);
        }

        report.push = self.processor.process_pending_operations().await?;

        match self.deleted.sync_deleted_records().await {
            Ok(deleted) => report.deleted = Some(deleted),
            Err(e) => report.record_error("deleted_records", e),
        }

        if let Some(company_id) = self.config.company_id {
            let result = self
                .projects
                .sync_company_projects(company_id, false, false)
                .await;
            report.record_pull("company_projects", result);
        }
        if let Some(user_id) = self.config.user_id {
            let result = self.projects.sync_user_projects(user_id).await;
            report.record_pull("user_projects", result);
            let result = self.support.sync_conversations(user_id).await;
            report.record_pull("support_conversations", result);
        }

        report.next_scheduled_at = self.ctx.store.next_scheduled_at().await?;
        info!("Sync cycle finished: {}", report.summary());
        Ok(report)
    }

    /// Pull one project: property, locations and rooms, room photos, then
    /// its metadata.
    ///
    /// `project_id` is the project's server id. Essentials run in order since
    /// rooms are listed per synced location. A failing essential stops the
    /// pull before metadata; a failed photo pull is only recorded.
    pub async fn sync_project(
        &self,
        project_id: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.ctx.is_online() {
            report.offline = true;
            return Ok(report);
        }

        let property = self.properties.sync_project_property(project_id).await?;
        report.pulled.insert("property".to_string(), property);
        let locations = self.locations.sync_locations(project_id).await?;
        report.pulled.insert("locations".to_string(), locations);
        let rooms = self.locations.sync_rooms(project_id, cancel).await?;
        report.pulled.insert("rooms".to_string(), rooms);
        let photos = self.photos.sync_project_photos(project_id, cancel).await;
        report.record_pull("photos", photos);

        report.metadata = Some(self.metadata.sync_project_metadata(project_id, cancel).await?);
        report.next_scheduled_at = self.ctx.store.next_scheduled_at().await?;
        info!("Project {} synced: {}", project_id, report.summary());
        Ok(report)
    }

    /// Connectivity came back: give failed operations a fresh budget and push.
    pub async fn on_network_restored(&self) -> Result<SyncReport> {
        let mut report = SyncReport {
            retried: self.processor.retry_failed_operations().await?,
            ..SyncReport::default()
        };
        if report.retried > 0 {
            info!("Network restored; reset {} failed operations", report.retried);
        }
        report.push = self.processor.process_pending_operations().await?;
        report.offline = report.push.skipped_offline;
        report.next_scheduled_at = self.ctx.store.next_scheduled_at().await?;
        Ok(report)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn processor(&self) -> &Arc<SyncQueueProcessor> {
        &self.processor
    }

    pub fn projects(&self) -> &ProjectSyncService {
        &self.projects
    }

    pub fn properties(&self) -> &PropertySyncService {
        &self.properties
    }

    pub fn locations(&self) -> &LocationRoomSyncService {
        &self.locations
    }

    pub fn notes(&self) -> &NoteSyncService {
        &self.notes
    }

    pub fn equipment(&self) -> &EquipmentSyncService {
        &self.equipment
    }

    pub fn moisture(&self) -> &MoistureLogSyncService {
        &self.moisture
    }

    pub fn photos(&self) -> &PhotoSyncService {
        &self.photos
    }

    pub fn work_scopes(&self) -> &WorkScopeSyncService {
        &self.work_scopes
    }

    pub fn support(&self) -> &SupportSyncService {
        &self.support
    }

    pub fn deleted_records(&self) -> &DeletedRecordsSyncService {
        &self.deleted
    }
}
