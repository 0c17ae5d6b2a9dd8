//! Durable outbound mutation queue.
//!
//! Local edits become [`PendingOperation`]s, one per entity. A drain hands
//! each due operation to its push handler and applies the outcome:
//!
//! | outcome | queue effect |
//! |---|---|
//! | success, drop | operation removed |
//! | skip | `skip_count += 1`, backoff, FAILED at `max_skips` |
//! | retry | untouched |
//! | conflict pending | CONFLICT |
//! | handler error | `retry_count += 1`, backoff, FAILED at `max_retries` |

use chrono::Utc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldsync_common::time::format_api_timestamp;
use fieldsync_common::{EntityKind, Error, Result};
use fieldsync_storage::queue::{
    LocationCreatePayload, ProjectCreatePayload, PropertyCreatePayload, PropertyUpdatePayload,
    RoomCreatePayload,
};
use fieldsync_storage::{
    EntityBody, OperationPayload, OperationPriority, OperationStatus, OperationType,
    PendingOperation, Record, SyncStatus,
};

use crate::conflict::{Resolution, ResolutionResult};
use crate::context::SyncContext;
use crate::handlers::HandlerRegistry;
use crate::metrics::MetricOutcome;
use crate::outcome::{CreatedProject, OperationOutcome, PendingOperationResult};
use crate::pull::merge_remote_record;
use crate::remap::IdRemapService;
use crate::retry::{to_chrono, RetryConfig};

/// Longest response body written to logs.
const MAX_LOGGED_BODY: usize = 500;

/// Lock token a local edit is based on: the record's `updated_at` while it
/// still mirrors the server, nothing once it carries unsynced edits.
pub fn observed_lock(record: &Record) -> Option<String> {
    (record.server_id.is_some() && !record.is_dirty).then(|| format_api_timestamp(&record.updated_at))
}

fn priority_for(kind: EntityKind) -> OperationPriority {
    match kind {
        EntityKind::Project => OperationPriority::Critical,
        EntityKind::Property | EntityKind::Location | EntityKind::Room => OperationPriority::High,
        EntityKind::Photo | EntityKind::SupportConversation | EntityKind::SupportMessage => {
            OperationPriority::Low
        }
        _ => OperationPriority::Medium,
    }
}

/// Persists outbound mutations and drains them through the push handlers.
pub struct SyncQueueProcessor {
    ctx: SyncContext,
    handlers: HandlerRegistry,
    retry: RetryConfig,
}

impl SyncQueueProcessor {
    /// Processor with the built-in handlers.
    pub fn new(ctx: SyncContext, retry: RetryConfig) -> Result<Self> {
        let remap = IdRemapService::new(ctx.store.clone());
        let handlers = HandlerRegistry::with_defaults(&ctx, &remap)?;
        Ok(Self::with_handlers(ctx, retry, handlers))
    }

    pub fn with_handlers(ctx: SyncContext, retry: RetryConfig, handlers: HandlerRegistry) -> Self {
        Self {
            ctx,
            handlers,
            retry,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn build(
        &self,
        record: &Record,
        operation_type: OperationType,
        payload: OperationPayload,
    ) -> Result<PendingOperation> {
        Ok(PendingOperation::new(
            record.kind(),
            record.id,
            record.uuid.clone(),
            operation_type,
            payload,
            priority_for(record.kind()),
        )?
        .with_limits(self.retry.max_retries, self.retry.max_skips))
    }

    async fn store_operation(&self, op: PendingOperation) -> Result<PendingOperation> {
        debug!(
            operation_id = %op.operation_id,
            entity_type = %op.entity_type,
            entity_id = op.entity_id,
            "Queued {}",
            op.operation_type.as_str()
        );
        self.ctx.store.enqueue_operation(op.clone()).await?;
        Ok(op)
    }

    /// Queue a CREATE, replacing whatever was queued for the entity.
    async fn enqueue_create(&self, record: &Record, payload: OperationPayload) -> Result<PendingOperation> {
        let op = self.build(record, OperationType::Create, payload)?;
        self.store_operation(op).await
    }

    /// Refresh the payload of a still-pending CREATE from the edited record.
    ///
    /// Counters, schedule and the idempotency key are kept. Returns `None`
    /// when no CREATE is queued.
    pub async fn update_create_operation_payload(
        &self,
        record: &Record,
    ) -> Result<Option<PendingOperation>> {
        let Some(mut existing) = self
            .ctx
            .store
            .operation_for_entity(record.kind(), record.id)
            .await?
        else {
            return Ok(None);
        };
        if existing.operation_type != OperationType::Create {
            return Ok(None);
        }

        let key = existing
            .payload
            .idempotency_key()
            .map(str::to_string)
            .unwrap_or_else(|| record.uuid.clone());
        existing.payload = match (&existing.payload, &record.body) {
            (OperationPayload::PropertyCreate(_), EntityBody::Property(body)) => {
                OperationPayload::PropertyCreate(PropertyCreatePayload {
                    property_local_id: record.id,
                    project_id: body.project_id,
                    idempotency_key: key,
                })
            }
            (OperationPayload::LocationCreate(_), EntityBody::Location(body)) => {
                OperationPayload::LocationCreate(LocationCreatePayload {
                    location_local_id: record.id,
                    location_uuid: record.uuid.clone(),
                    project_id: body.project_id,
                    property_local_id: body.property_id,
                    idempotency_key: key,
                })
            }
            (OperationPayload::RoomCreate(_), EntityBody::Room(_)) => {
                self.room_create_payload(record, key).await?
            }
            (payload, _) => payload.clone(),
        };
        debug!(
            operation_id = %existing.operation_id,
            "Folded local edit into pending create"
        );
        self.ctx.store.enqueue_operation(existing.clone()).await?;
        Ok(Some(existing))
    }

    /// Queue an UPDATE, or fold it into the pending CREATE if the entity has no server id.
    ///
    /// A lock token already queued for the entity wins over `lock`.
    async fn enqueue_update(
        &self,
        record: &Record,
        lock: Option<String>,
    ) -> Result<Option<PendingOperation>> {
        if record.server_id.is_none() {
            let folded = self.update_create_operation_payload(record).await?;
            if folded.is_none() {
                warn!(
                    entity_type = %record.kind(),
                    entity_id = record.id,
                    "Update for unsynced entity with no pending create; skipping"
                );
            }
            return Ok(folded);
        }

        let lock = self.first_observed_lock(record, lock).await?;
        let payload = match &record.body {
            EntityBody::Property(body) => OperationPayload::PropertyUpdate(PropertyUpdatePayload {
                project_id: body.project_id,
                lock_updated_at: lock,
            }),
            _ => OperationPayload::lock(lock),
        };
        let op = self.build(record, OperationType::Update, payload)?;
        self.store_superseding(op).await.map(Some)
    }

    /// Queue a DELETE. An entity the server never saw is deleted locally instead.
    async fn enqueue_delete(
        &self,
        record: &Record,
        lock: Option<String>,
    ) -> Result<Option<PendingOperation>> {
        if record.server_id.is_none() {
            let removed = self
                .ctx
                .store
                .remove_operations_for_entity(record.kind(), record.id)
                .await?;
            let mut deleted = record.clone();
            deleted.mark_deleted_synced();
            self.ctx.store.save(deleted).await?;
            debug!(
                entity_type = %record.kind(),
                entity_id = record.id,
                "Deleted never-synced entity locally ({} operations dropped)",
                removed
            );
            return Ok(None);
        }

        let lock = self.first_observed_lock(record, lock).await?;
        let op = self.build(record, OperationType::Delete, OperationPayload::lock(lock))?;
        self.store_superseding(op).await.map(Some)
    }

    /// Store `op` in place of the entity's queued operation.
    ///
    /// An operation parked in CONFLICT keeps its id, status and counters so
    /// the open conflict still points at it; only the mutation changes.
    async fn store_superseding(&self, mut op: PendingOperation) -> Result<PendingOperation> {
        let existing = self
            .ctx
            .store
            .operation_for_entity(op.entity_type, op.entity_id)
            .await?;
        if let Some(existing) = existing.filter(|e| e.status == OperationStatus::Conflict) {
            op.operation_id = existing.operation_id;
            op.status = existing.status;
            op.retry_count = existing.retry_count;
            op.skip_count = existing.skip_count;
            op.created_at = existing.created_at;
            op.scheduled_at = existing.scheduled_at;
            op.last_attempt_at = existing.last_attempt_at;
            op.error_message = existing.error_message;
            debug!(
                operation_id = %op.operation_id,
                "Local edit kept behind unresolved conflict"
            );
        }
        self.store_operation(op).await
    }

    async fn first_observed_lock(
        &self,
        record: &Record,
        lock: Option<String>,
    ) -> Result<Option<String>> {
        let queued = self
            .ctx
            .store
            .operation_for_entity(record.kind(), record.id)
            .await?
            .and_then(|op| op.payload.lock_updated_at().map(str::to_string));
        Ok(queued.or(lock))
    }

    /// CREATE if the entity has no server id yet, UPDATE otherwise.
    async fn enqueue_upsert(
        &self,
        record: &Record,
        lock: Option<String>,
    ) -> Result<Option<PendingOperation>> {
        if record.server_id.is_some() {
            return self.enqueue_update(record, lock).await;
        }
        if let Some(op) = self.update_create_operation_payload(record).await? {
            return Ok(Some(op));
        }
        self.enqueue_create(record, OperationPayload::create(Uuid::new_v4().to_string()))
            .await
            .map(Some)
    }

    async fn room_create_payload(&self, record: &Record, key: String) -> Result<OperationPayload> {
        let EntityBody::Room(body) = &record.body else {
            return Err(Error::InvalidInput(format!("{} is not a room", record.kind())));
        };

        let (level_server_id, level_uuid) = self.location_slot(body.level_id).await?;
        let (location_server_id, location_uuid) = self.location_slot(body.location_id).await?;

        Ok(OperationPayload::RoomCreate(RoomCreatePayload {
            room_local_id: record.id,
            room_uuid: record.uuid.clone(),
            project_id: body.project_id,
            level_server_id,
            level_uuid,
            location_server_id,
            location_uuid,
            idempotency_key: key,
        }))
    }

    /// Server id and uuid of a referenced location, as far as they are known.
    async fn location_slot(&self, reference: Option<i64>) -> Result<(Option<i64>, Option<String>)> {
        let Some(reference) = reference else {
            return Ok((None, None));
        };
        Ok(match self.ctx.store.resolve(EntityKind::Location, reference).await? {
            Some(location) => (location.server_id, Some(location.uuid)),
            None => (Some(reference).filter(|id| *id > 0), None),
        })
    }

    pub async fn enqueue_project_create(
        &self,
        record: &Record,
        company_id: Option<i64>,
    ) -> Result<PendingOperation> {
        let payload = OperationPayload::ProjectCreate(ProjectCreatePayload {
            local_project_id: record.id,
            company_id,
            idempotency_key: Uuid::new_v4().to_string(),
        });
        self.enqueue_create(record, payload).await
    }

    pub async fn enqueue_project_update(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_update(record, lock).await
    }

    pub async fn enqueue_project_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_property_create(&self, record: &Record) -> Result<PendingOperation> {
        let EntityBody::Property(body) = &record.body else {
            return Err(Error::InvalidInput(format!("{} is not a property", record.kind())));
        };
        let payload = OperationPayload::PropertyCreate(PropertyCreatePayload {
            property_local_id: record.id,
            project_id: body.project_id,
            idempotency_key: Uuid::new_v4().to_string(),
        });
        self.enqueue_create(record, payload).await
    }

    pub async fn enqueue_property_update(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_update(record, lock).await
    }

    pub async fn enqueue_property_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_location_create(&self, record: &Record) -> Result<PendingOperation> {
        let EntityBody::Location(body) = &record.body else {
            return Err(Error::InvalidInput(format!("{} is not a location", record.kind())));
        };
        let payload = OperationPayload::LocationCreate(LocationCreatePayload {
            location_local_id: record.id,
            location_uuid: record.uuid.clone(),
            project_id: body.project_id,
            property_local_id: body.property_id,
            idempotency_key: Uuid::new_v4().to_string(),
        });
        self.enqueue_create(record, payload).await
    }

    pub async fn enqueue_location_update(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_update(record, lock).await
    }

    pub async fn enqueue_location_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_room_create(&self, record: &Record) -> Result<PendingOperation> {
        let payload = self
            .room_create_payload(record, Uuid::new_v4().to_string())
            .await?;
        self.enqueue_create(record, payload).await
    }

    pub async fn enqueue_room_update(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_update(record, lock).await
    }

    pub async fn enqueue_room_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_note_upsert(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_upsert(record, lock).await
    }

    pub async fn enqueue_note_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_equipment_upsert(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_upsert(record, lock).await
    }

    pub async fn enqueue_equipment_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_moisture_log_upsert(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_upsert(record, lock).await
    }

    pub async fn enqueue_moisture_log_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_atmospheric_log_upsert(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_upsert(record, lock).await
    }

    pub async fn enqueue_atmospheric_log_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_photo_delete(&self, record: &Record, lock: Option<String>) -> Result<Option<PendingOperation>> {
        self.enqueue_delete(record, lock).await
    }

    pub async fn enqueue_support_conversation_create(&self, record: &Record) -> Result<PendingOperation> {
        self.enqueue_create(record, OperationPayload::create(Uuid::new_v4().to_string()))
            .await
    }

    pub async fn enqueue_support_message_create(&self, record: &Record) -> Result<PendingOperation> {
        self.enqueue_create(record, OperationPayload::create(Uuid::new_v4().to_string()))
            .await
    }

    /// Drain every due operation once.
    ///
    /// Per-operation failures never surface here; they end up in the
    /// operation's own state. Only local storage failures are returned.
    pub async fn process_pending_operations(&self) -> Result<PendingOperationResult> {
        let mut result = PendingOperationResult::default();
        if !self.ctx.is_online() {
            info!("Network unavailable; skipping queue drain");
            result.skipped_offline = true;
            result.metrics.finish();
            return Ok(result);
        }

        let due = self.ctx.store.pending_operations(Utc::now()).await?;
        if !due.is_empty() {
            info!("Processing {} pending operations", due.len());
        }

        for queued in due {
            // Earlier operations in this drain may have rewritten or removed it.
            let Some(op) = self.ctx.store.get_operation(&queued.operation_id).await? else {
                continue;
            };
            if !op.is_due(Utc::now()) {
                continue;
            }
            self.process_operation(op, &mut result).await?;
        }

        result.metrics.finish();
        result.metrics.log_summary();
        Ok(result)
    }

    async fn process_operation(
        &self,
        mut op: PendingOperation,
        result: &mut PendingOperationResult,
    ) -> Result<()> {
        let started = Instant::now();
        let kind = op.entity_type;
        let operation_type = op.operation_type;

        let outcome = match self.precheck(&op).await? {
            Some(outcome) => Ok(outcome),
            None => match self.handlers.resolve(kind) {
                Some(handler) => handler.push(&op).await,
                None => Ok(OperationOutcome::dropped(format!("no push handler for {}", kind))),
            },
        };

        let now = Utc::now();
        op.last_attempt_at = Some(now);
        let metric = match outcome {
            Ok(OperationOutcome::Success) => {
                self.ctx.store.remove_operation(&op.operation_id).await?;
                if kind == EntityKind::Project && operation_type == OperationType::Create {
                    if let Some(server_id) = self
                        .ctx
                        .store
                        .get(kind, op.entity_id)
                        .await?
                        .and_then(|record| record.server_id)
                    {
                        result.created_projects.push(CreatedProject {
                            local_project_id: op.entity_id,
                            server_project_id: server_id,
                        });
                    }
                }
                debug!(operation_id = %op.operation_id, "Operation succeeded");
                Some(MetricOutcome::Success)
            }
            Ok(OperationOutcome::Drop(reason)) => {
                self.ctx.store.remove_operation(&op.operation_id).await?;
                info!(
                    operation_id = %op.operation_id,
                    entity_type = %kind,
                    entity_id = op.entity_id,
                    "Dropped operation: {}",
                    reason
                );
                Some(MetricOutcome::Drop)
            }
            Ok(OperationOutcome::Skip(hint)) => {
                self.apply_skip(&mut op, hint).await?;
                Some(MetricOutcome::Skip)
            }
            Ok(OperationOutcome::Retry) => None,
            Ok(OperationOutcome::ConflictPending(reason)) => {
                op.status = OperationStatus::Conflict;
                op.error_message = Some(reason);
                self.ctx.store.enqueue_operation(op.clone()).await?;
                Some(MetricOutcome::ConflictPending)
            }
            Err(err) => {
                self.apply_failure(&mut op, &err).await?;
                Some(MetricOutcome::Failure)
            }
        };

        if let Some(metric) = metric {
            result
                .metrics
                .record(kind, operation_type, metric, started.elapsed());
        }
        Ok(())
    }

    /// Outcome decided without calling a handler, if any.
    async fn precheck(&self, op: &PendingOperation) -> Result<Option<OperationOutcome>> {
        if !op.payload.is_valid_for(op.entity_type, op.operation_type) {
            return Ok(Some(OperationOutcome::dropped(format!(
                "illegal {} operation for {}",
                op.operation_type.as_str(),
                op.entity_type
            ))));
        }
        if op.operation_type != OperationType::Delete {
            let deleted = self
                .ctx
                .store
                .get(op.entity_type, op.entity_id)
                .await?
                .map_or(false, |record| record.is_deleted);
            if deleted {
                return Ok(Some(OperationOutcome::dropped(format!(
                    "{} {} was deleted locally",
                    op.entity_type, op.entity_id
                ))));
            }
        }
        Ok(None)
    }

    async fn apply_skip(&self, op: &mut PendingOperation, hint: String) -> Result<()> {
        let next = op.skip_count + 1;
        op.skip_count = next;
        if next >= op.max_skips {
            op.status = OperationStatus::Failed;
            op.scheduled_at = None;
            op.error_message = Some(format!(
                "Max skip count reached - dependencies never resolved: {}",
                hint
            ));
            warn!(
                operation_id = %op.operation_id,
                entity_type = %op.entity_type,
                entity_id = op.entity_id,
                "Giving up after {} skips: {}",
                next,
                hint
            );
        } else {
            let delay = self.retry.skip_delay(next);
            op.scheduled_at = Some(Utc::now() + to_chrono(delay));
            op.error_message = Some(hint.clone());
            debug!(
                operation_id = %op.operation_id,
                "Skipped ({}); next attempt in {:?}",
                hint,
                delay
            );
        }
        self.ctx.store.enqueue_operation(op.clone()).await
    }

    async fn apply_failure(&self, op: &mut PendingOperation, err: &Error) -> Result<()> {
        error!(
            operation_id = %op.operation_id,
            entity_type = %op.entity_type,
            entity_id = op.entity_id,
            http_status = ?err.http_status(),
            body = ?err.response_body(MAX_LOGGED_BODY),
            "Push failed: {}",
            err
        );

        if op.retry_count + 1 < op.max_retries {
            let delay = self.retry.retry_delay(op.retry_count);
            op.retry_count += 1;
            op.scheduled_at = Some(Utc::now() + to_chrono(delay));
            op.error_message = Some(err.to_string());
        } else {
            op.retry_count += 1;
            op.status = OperationStatus::Failed;
            op.scheduled_at = None;
            op.error_message = Some(err.to_string());
            warn!(
                operation_id = %op.operation_id,
                "Operation failed permanently after {} attempts",
                op.retry_count
            );
        }
        self.ctx.store.enqueue_operation(op.clone()).await
    }

    /// Put every FAILED operation back in line.
    pub async fn retry_failed_operations(&self) -> Result<usize> {
        let reset = self.ctx.store.reset_failed_operations().await?;
        if reset > 0 {
            info!("Reset {} failed operations", reset);
        }
        Ok(reset)
    }

    /// Settle a CONFLICT operation.
    ///
    /// # Errors
    /// - `NotFound` if the operation does not exist
    /// - `InvalidInput` if it is not in CONFLICT
    pub async fn resolve_conflict(
        &self,
        operation_id: &str,
        resolution: Resolution,
    ) -> Result<ResolutionResult> {
        let mut op = self
            .ctx
            .store
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {}", operation_id)))?;
        if op.status != OperationStatus::Conflict {
            return Err(Error::InvalidInput(format!(
                "operation {} is {}, not CONFLICT",
                operation_id,
                op.status.as_str()
            )));
        }
        let record = self.ctx.store.get(op.entity_type, op.entity_id).await?;
        let server_id = record.as_ref().and_then(|r| r.server_id);

        let outcome = match resolution {
            Resolution::KeepLocal => {
                let lock = match server_id {
                    Some(server_id) => {
                        let current = self.ctx.remote.get(op.entity_type, server_id).await?;
                        Some(format_api_timestamp(&current.updated_at))
                    }
                    None => None,
                };
                op.payload.set_lock_updated_at(lock.clone());
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.skip_count = 0;
                op.scheduled_at = None;
                op.error_message = None;
                self.ctx.store.enqueue_operation(op.clone()).await?;
                if let Some(mut record) = record {
                    record.sync_status = SyncStatus::Pending;
                    self.ctx.store.save(record).await?;
                }
                ResolutionResult::Requeued {
                    lock_updated_at: lock,
                }
            }
            Resolution::KeepRemote => {
                self.ctx.store.remove_operation(&op.operation_id).await?;
                if let Some(mut record) = record {
                    record.is_dirty = false;
                    record.sync_status = SyncStatus::Synced;
                    self.ctx.store.save(record).await?;
                    if let Some(server_id) = server_id {
                        match self.ctx.remote.get(op.entity_type, server_id).await {
                            Ok(current) => {
                                merge_remote_record(self.ctx.store.as_ref(), current).await?;
                            }
                            Err(err) => debug!(
                                "Could not refresh {} {} after discarding local edit: {}",
                                op.entity_type, server_id, err
                            ),
                        }
                    }
                }
                ResolutionResult::Discarded
            }
        };

        let now = Utc::now();
        for mut conflict in self.ctx.store.open_conflicts().await? {
            if conflict.operation_id == op.operation_id {
                conflict.resolved_at = Some(now);
                self.ctx.store.save_conflict(conflict).await?;
            }
        }
        info!(
            operation_id = %op.operation_id,
            "Conflict resolved with {}",
            resolution
        );
        Ok(outcome)
    }
}
