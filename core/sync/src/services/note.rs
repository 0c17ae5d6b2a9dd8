use std::sync::Arc;

use fieldsync_common::{EntityKind, Result};
use fieldsync_remote::{ListQuery, Scope};
use fieldsync_storage::model::NoteBody;
use fieldsync_storage::{EntityBody, Record};

use super::{delete_local, edit_local, insert_local};
use crate::checkpoint::project_notes_key;
use crate::context::SyncContext;
use crate::processor::SyncQueueProcessor;
use crate::pull::{pull_collection, PullStats};

/// Page size the notes endpoint is asked for.
pub const DEFAULT_NOTES_PAGE_LIMIT: u32 = 30;

/// Project notes.
#[derive(Clone)]
pub struct NoteSyncService {
    ctx: SyncContext,
    processor: Arc<SyncQueueProcessor>,
    page_limit: u32,
}

impl NoteSyncService {
    pub fn new(ctx: SyncContext, processor: Arc<SyncQueueProcessor>) -> Self {
        Self {
            ctx,
            processor,
            page_limit: DEFAULT_NOTES_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub async fn sync_project_notes(&self, project_id: i64) -> Result<PullStats> {
        let query =
            ListQuery::new(EntityKind::Note, Scope::Project(project_id)).limit(self.page_limit);
        let (stats, _) =
            pull_collection(&self.ctx, query, &project_notes_key(project_id), None).await?;
        Ok(stats)
    }

    pub async fn create_note(&self, body: NoteBody) -> Result<Record> {
        let record = insert_local(&self.ctx, EntityBody::Note(body)).await?;
        self.processor.enqueue_note_upsert(&record, None).await?;
        Ok(record)
    }

    pub async fn update_note(&self, id: i64, body: NoteBody) -> Result<Record> {
        let (record, lock) = edit_local(&self.ctx, id, EntityBody::Note(body)).await?;
        self.processor.enqueue_note_upsert(&record, lock).await?;
        Ok(record)
    }

    pub async fn delete_note(&self, id: i64) -> Result<()> {
        let (record, lock) = delete_local(&self.ctx, EntityKind::Note, id).await?;
        self.processor.enqueue_note_delete(&record, lock).await?;
        Ok(())
    }
}
