//! Push handlers: one per entity family, resolved through a registry.
//!
//! A handler turns a pending operation into remote calls and reports an
//! [`OperationOutcome`]. Errors returned from a handler are transient by
//! contract; the processor feeds them into the retry path.

mod child;
mod location_room;
mod project;
mod property;
mod support;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::time::format_api_timestamp;
use fieldsync_common::{is_local_id, EntityKind, Error, Result};
use fieldsync_remote::ApiError;
use fieldsync_storage::{EntityBody, PendingOperation, Record, SyncStatus};

use crate::conflict::stale_lock_conflict;
use crate::context::SyncContext;
use crate::outcome::OperationOutcome;
use crate::remap::IdRemapService;

pub use child::ChildPushHandler;
pub use location_room::LocationRoomPushHandler;
pub use project::ProjectPushHandler;
pub use property::PropertyPushHandler;
pub use support::SupportPushHandler;

/// Pushes pending operations of one or more entity kinds.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Push one operation.
    ///
    /// # Errors
    /// - Any transient failure (network, 5xx, storage); the caller schedules a retry
    async fn push(&self, op: &PendingOperation) -> Result<OperationOutcome>;
}

/// Maps entity kinds to their push handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EntityKind, Arc<dyn PushHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind.
    ///
    /// # Errors
    /// - `InvalidInput` if the kind already has a handler
    pub fn register(&mut self, kind: EntityKind, handler: Arc<dyn PushHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(Error::InvalidInput(format!(
                "Push handler for '{}' is already registered",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn resolve(&self, kind: EntityKind) -> Option<Arc<dyn PushHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn has_handler(&self, kind: EntityKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Registry with the built-in handler for every pushable kind.
    pub fn with_defaults(ctx: &SyncContext, remap: &IdRemapService) -> Result<Self> {
        let push = PushContext::new(ctx.clone(), remap.clone());
        let mut registry = Self::new();

        registry.register(EntityKind::Project, Arc::new(ProjectPushHandler::new(push.clone())))?;
        registry.register(EntityKind::Property, Arc::new(PropertyPushHandler::new(push.clone())))?;

        let location_room: Arc<dyn PushHandler> =
            Arc::new(LocationRoomPushHandler::new(push.clone()));
        registry.register(EntityKind::Location, location_room.clone())?;
        registry.register(EntityKind::Room, location_room)?;

        let child: Arc<dyn PushHandler> = Arc::new(ChildPushHandler::new(push.clone()));
        for kind in [
            EntityKind::Note,
            EntityKind::Equipment,
            EntityKind::MoistureLog,
            EntityKind::AtmosphericLog,
            EntityKind::Photo,
        ] {
            registry.register(kind, child.clone())?;
        }

        let support: Arc<dyn PushHandler> = Arc::new(SupportPushHandler::new(push));
        registry.register(EntityKind::SupportConversation, support.clone())?;
        registry.register(EntityKind::SupportMessage, support)?;

        Ok(registry)
    }
}

/// Hint used when a parent has no server id yet.
pub(crate) fn waiting_for(kind: EntityKind, reference: impl std::fmt::Display) -> String {
    format!("waiting for {} {} to sync", kind, reference)
}

/// Collaborators shared by all push handlers.
#[derive(Clone)]
pub(crate) struct PushContext {
    pub ctx: SyncContext,
    pub remap: IdRemapService,
}

impl PushContext {
    pub fn new(ctx: SyncContext, remap: IdRemapService) -> Self {
        Self { ctx, remap }
    }

    /// The operation's entity, by local id.
    pub async fn load(&self, op: &PendingOperation) -> Result<Option<Record>> {
        self.ctx.store.get(op.entity_type, op.entity_id).await
    }

    /// Server id for a reference holding either a local or a server id.
    ///
    /// A positive reference with no local row is taken to be a server id
    /// already (e.g. lookup tables that are never stored locally).
    pub async fn server_id_for(&self, kind: EntityKind, reference: i64) -> Result<Option<i64>> {
        match self.ctx.store.resolve(kind, reference).await? {
            Some(record) => Ok(record.server_id),
            None if !is_local_id(reference) && reference != 0 => Ok(Some(reference)),
            None => Ok(None),
        }
    }

    /// Copy of `body` with every reference rewritten to a server id.
    ///
    /// Returns `Err(hint)` naming the first parent that has not synced.
    pub async fn resolve_body(
        &self,
        body: &EntityBody,
    ) -> Result<std::result::Result<EntityBody, String>> {
        let mut resolved = body.clone();
        for (kind, reference) in body.references() {
            match self.server_id_for(kind, reference).await? {
                Some(server_id) => {
                    resolved.remap_reference(kind, reference, server_id);
                }
                None => return Ok(Err(waiting_for(kind, reference))),
            }
        }
        Ok(Ok(resolved))
    }

    /// Lock token for an update or delete: the payload's, else the record's last known server time.
    pub fn lock_token(op: &PendingOperation, record: &Record) -> String {
        op.payload
            .lock_updated_at()
            .map(str::to_string)
            .unwrap_or_else(|| format_api_timestamp(&record.updated_at))
    }

    /// Idempotency key for a create: the payload's, else the entity uuid.
    pub fn idempotency_key(op: &PendingOperation) -> String {
        op.payload
            .idempotency_key()
            .map(str::to_string)
            .unwrap_or_else(|| op.entity_uuid.clone())
    }

    /// Persist a stale-lock conflict and park the entity in CONFLICT.
    pub async fn record_conflict(
        &self,
        op: &PendingOperation,
        record: Option<Record>,
        err: &ApiError,
    ) -> Result<OperationOutcome> {
        let conflict = stale_lock_conflict(op, record.as_ref(), err)?;
        self.ctx.store.save_conflict(conflict).await?;

        if let Some(mut record) = record {
            record.sync_status = SyncStatus::Conflict;
            self.ctx.store.save(record).await?;
        }

        warn!(
            operation_id = %op.operation_id,
            entity_type = %op.entity_type,
            entity_id = op.entity_id,
            "Stale lock token: {}",
            err.message
        );
        Ok(OperationOutcome::ConflictPending(err.message.clone()))
    }

    /// Create the entity server-side and store the assigned id.
    ///
    /// Returns the saved record on success so callers can remap children.
    pub async fn create(
        &self,
        op: &PendingOperation,
        record: Record,
        body: EntityBody,
    ) -> Result<std::result::Result<Record, OperationOutcome>> {
        if record.server_id.is_some() {
            debug!(
                operation_id = %op.operation_id,
                "{} {} already has a server id",
                op.entity_type,
                op.entity_id
            );
            return Ok(Err(OperationOutcome::Success));
        }

        let key = Self::idempotency_key(op);
        let created = self
            .ctx
            .remote
            .create(op.entity_type, &record.uuid, &body, &key)
            .await?;

        let mut record = record;
        record.body = body;
        record.mark_synced(created.id, created.updated_at);
        self.ctx.store.save(record.clone()).await?;
        debug!(
            operation_id = %op.operation_id,
            entity_type = %op.entity_type,
            "Created {} {} as server id {}",
            op.entity_type,
            record.id,
            created.id
        );
        Ok(Ok(record))
    }

    /// Plain update: resolve references, send with the lock token, store the new server time.
    pub async fn update(&self, op: &PendingOperation, record: Record) -> Result<OperationOutcome> {
        let Some(server_id) = record.server_id else {
            return Ok(OperationOutcome::skip(waiting_for(op.entity_type, record.id)));
        };
        let body = match self.resolve_body(&record.body).await? {
            Ok(body) => body,
            Err(hint) => return Ok(OperationOutcome::Skip(hint)),
        };

        let lock = Self::lock_token(op, &record);
        match self
            .ctx
            .remote
            .update(op.entity_type, server_id, &body, &lock)
            .await
        {
            Ok(updated) => {
                self.finish_update(record, updated.updated_at).await?;
                Ok(OperationOutcome::Success)
            }
            Err(err) if err.is_conflict() => self.record_conflict(op, Some(record), &err).await,
            Err(err) => Err(err.into()),
        }
    }

    pub async fn finish_update(
        &self,
        mut record: Record,
        server_updated_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        if let Some(server_id) = record.server_id {
            record.mark_synced(server_id, server_updated_at);
            self.ctx.store.save(record).await?;
        }
        Ok(())
    }

    /// Delete server-side; already gone counts as deleted.
    pub async fn delete(&self, op: &PendingOperation, record: Option<Record>) -> Result<OperationOutcome> {
        let Some(mut record) = record else {
            return Ok(OperationOutcome::Success);
        };
        let Some(server_id) = record.server_id else {
            record.mark_deleted_synced();
            self.ctx.store.save(record).await?;
            return Ok(OperationOutcome::Success);
        };

        let lock = Self::lock_token(op, &record);
        match self.ctx.remote.delete(op.entity_type, server_id, &lock).await {
            Ok(()) => {}
            Err(err) if err.is_missing() => {
                debug!(
                    operation_id = %op.operation_id,
                    "{} {} already gone server-side",
                    op.entity_type,
                    server_id
                );
            }
            Err(err) if err.is_conflict() => {
                return self.record_conflict(op, Some(record), &err).await;
            }
            Err(err) => return Err(err.into()),
        }

        record.mark_deleted_synced();
        self.ctx.store.save(record).await?;
        Ok(OperationOutcome::Success)
    }
}

/// Drop reason for an operation whose entity vanished locally.
pub(crate) fn missing_locally(op: &PendingOperation) -> OperationOutcome {
    OperationOutcome::dropped(format!(
        "{} {} no longer exists locally",
        op.entity_type, op.entity_id
    ))
}

/// Drop reason for a payload the handler cannot push.
pub(crate) fn unsupported(op: &PendingOperation) -> OperationOutcome {
    OperationOutcome::dropped(format!(
        "unsupported {} operation for {}",
        op.operation_type.as_str(),
        op.entity_type
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::testing::{harness, TestHarness};
    use fieldsync_storage::model::NoteBody;
    use fieldsync_storage::{LocalStore, OperationPayload, OperationPriority, OperationType};

    pub(crate) fn push_context(h: &TestHarness) -> PushContext {
        PushContext::new(h.ctx.clone(), IdRemapService::new(h.ctx.store.clone()))
    }

    struct Noop;

    #[async_trait]
    impl PushHandler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn push(&self, _op: &PendingOperation) -> Result<OperationOutcome> {
            Ok(OperationOutcome::Success)
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register(EntityKind::Note, Arc::new(Noop)).unwrap();
        assert!(registry.register(EntityKind::Note, Arc::new(Noop)).is_err());
        assert!(registry.has_handler(EntityKind::Note));
        assert!(registry.resolve(EntityKind::Album).is_none());
    }

    #[test]
    fn test_default_registry_covers_pushable_kinds() {
        let h = harness();
        let registry =
            HandlerRegistry::with_defaults(&h.ctx, &IdRemapService::new(h.ctx.store.clone()))
                .unwrap();
        assert_eq!(registry.kinds().len(), 11);
        assert!(!registry.has_handler(EntityKind::Album));
        assert_eq!(
            registry.resolve(EntityKind::Room).map(|handler| handler.name()),
            Some("location_room")
        );
    }

    #[tokio::test]
    async fn test_resolve_body_reports_unsynced_parent() {
        let h = harness();
        let push = push_context(&h);
        let body = EntityBody::Note(NoteBody {
            project_id: 77,
            room_id: Some(-123),
            content: "c".to_string(),
            category_id: None,
        });

        let hint = push.resolve_body(&body).await.unwrap().unwrap_err();
        assert_eq!(hint, "waiting for room -123 to sync");
    }

    #[tokio::test]
    async fn test_delete_of_missing_server_row_succeeds() {
        let h = harness();
        let push = push_context(&h);
        let mut record = Record::new_local(
            -9,
            EntityBody::Note(NoteBody {
                project_id: 77,
                room_id: None,
                content: "c".to_string(),
                category_id: None,
            }),
        );
        record.mark_synced(31337, Utc::now());
        h.store.save(record.clone()).await.unwrap();

        let op = PendingOperation::new(
            EntityKind::Note,
            -9,
            record.uuid.clone(),
            OperationType::Delete,
            OperationPayload::lock(None),
            OperationPriority::Medium,
        )
        .unwrap();

        let outcome = push.delete(&op, Some(record)).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Success);
        let stored = h.store.get(EntityKind::Note, -9).await.unwrap().unwrap();
        assert!(stored.is_deleted);
    }
}
