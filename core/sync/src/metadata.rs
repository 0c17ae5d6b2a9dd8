//! Per-project metadata pull.
//!
//! Runs the project's child collections through a fresh
//! [`DependencySyncQueue`]: independent collections go in one wave, work
//! scopes wait for damages.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use fieldsync_common::Result;

use crate::dependency::{DependencyReport, DependencySyncQueue, ItemId};
use crate::pull::{ensure_active, PullStats};
use crate::services::{
    EquipmentSyncService, MoistureLogSyncService, NoteSyncService, WorkScopeSyncService,
};

/// Outcome of one metadata pull.
#[derive(Debug, Clone, Default)]
pub struct MetadataSyncResult {
    /// Pull counts for every unit that completed, by unit name.
    pub stats: BTreeMap<String, PullStats>,
    pub report: DependencyReport,
}

impl MetadataSyncResult {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }

    pub fn total(&self) -> PullStats {
        let mut total = PullStats::default();
        for stats in self.stats.values() {
            total.absorb(*stats);
        }
        total
    }
}

type StatsSink = Arc<Mutex<BTreeMap<String, PullStats>>>;

/// Pulls every child collection of a project.
#[derive(Clone)]
pub struct ProjectMetadataSyncService {
    notes: NoteSyncService,
    equipment: EquipmentSyncService,
    moisture: MoistureLogSyncService,
    work_scopes: WorkScopeSyncService,
}

impl ProjectMetadataSyncService {
    pub fn new(
        notes: NoteSyncService,
        equipment: EquipmentSyncService,
        moisture: MoistureLogSyncService,
        work_scopes: WorkScopeSyncService,
    ) -> Self {
        Self {
            notes,
            equipment,
            moisture,
            work_scopes,
        }
    }

    pub async fn sync_project_metadata(
        &self,
        project_id: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<MetadataSyncResult> {
        ensure_active(cancel, "project metadata")?;
        let sink: StatsSink = Arc::default();
        let cancel = cancel.cloned();
        let mut queue = DependencySyncQueue::new();

        let notes = self.notes.clone();
        add_unit(&mut queue, "notes", &[], &sink, &cancel, move || async move {
            notes.sync_project_notes(project_id).await
        });
        let equipment = self.equipment.clone();
        add_unit(&mut queue, "equipment", &[], &sink, &cancel, move || async move {
            equipment.sync_project_equipment(project_id).await
        });
        let work_scopes = self.work_scopes.clone();
        let damages = add_unit(&mut queue, "damages", &[], &sink, &cancel, move || async move {
            work_scopes.sync_project_damages(project_id).await
        });
        let moisture = self.moisture.clone();
        add_unit(&mut queue, "moisture_logs", &[], &sink, &cancel, move || async move {
            moisture.sync_project_moisture_logs(project_id).await
        });
        let moisture = self.moisture.clone();
        add_unit(&mut queue, "atmospheric_logs", &[], &sink, &cancel, move || async move {
            moisture.sync_project_atmospheric_logs(project_id).await
        });
        let work_scopes = self.work_scopes.clone();
        add_unit(
            &mut queue,
            "work_scopes",
            &[damages],
            &sink,
            &cancel,
            move || async move { work_scopes.sync_work_scopes_for_project(project_id).await },
        );

        let report = queue.process_all_with_report().await;
        let stats = std::mem::take(&mut *sink.lock().await);
        Ok(MetadataSyncResult { stats, report })
    }
}

fn add_unit<F, Fut>(
    queue: &mut DependencySyncQueue,
    name: &'static str,
    depends_on: &[ItemId],
    sink: &StatsSink,
    cancel: &Option<CancellationToken>,
    work: F,
) -> ItemId
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<PullStats>> + Send + 'static,
{
    let sink = sink.clone();
    let cancel = cancel.clone();
    queue.add_item(name, depends_on, move || async move {
        ensure_active(cancel.as_ref(), name)?;
        let stats = work().await?;
        sink.lock().await.insert(name.to_string(), stats);
        Ok(())
    })
}
