//! In-memory fake server.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use fieldsync_common::time::{format_api_timestamp, format_http_date, parse_api_timestamp};
use fieldsync_common::{EntityKind, Error, Result};
use fieldsync_storage::EntityBody;

use crate::api::{
    DatedResponse, DeletedRecords, ListQuery, Page, PageMeta, RemoteApi, RemoteRecord, Scope,
};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    record: RemoteRecord,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ServerState {
    rows: BTreeMap<(EntityKind, i64), Row>,
    next_id: i64,
    idempotency: HashMap<String, (EntityKind, i64)>,
    clock: DateTime<Utc>,
    page_size: usize,
    send_date_header: bool,
    failures: VecDeque<ApiError>,
    create_calls: usize,
}

impl ServerState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(1);
        self.clock
    }

    fn live(&self, kind: EntityKind, id: i64) -> ApiResult<&Row> {
        match self.rows.get(&(kind, id)) {
            Some(row) if row.deleted_at.is_none() => Ok(row),
            Some(_) => Err(ApiError::http(410, format!("{} {} was deleted", kind, id))),
            None => Err(ApiError::http(404, format!("{} {} not found", kind, id))),
        }
    }

    fn check_lock(&self, kind: EntityKind, id: i64, lock_updated_at: &str) -> ApiResult<()> {
        let row = self.live(kind, id)?;
        let current = format_api_timestamp(&row.record.updated_at);
        if current != lock_updated_at {
            let body = serde_json::to_string(&row.record).unwrap_or_default();
            return Err(ApiError::http(
                409,
                format!("{} {} was modified at {}", kind, id, current),
            )
            .with_body(body));
        }
        Ok(())
    }
}

/// Persistent part of the server state. Queued failures are not kept.
#[derive(Debug, Serialize, Deserialize)]
struct ServerSnapshot {
    rows: Vec<Row>,
    next_id: i64,
    idempotency: Vec<(String, EntityKind, i64)>,
    clock: DateTime<Utc>,
}

fn matches_scope(body: &EntityBody, scope: Scope) -> bool {
    match scope {
        Scope::Global => true,
        Scope::Company {
            company_id,
            assigned_only,
        } => match body {
            EntityBody::Project(p) => {
                p.company_id == Some(company_id) && (!assigned_only || !p.assigned_user_ids.is_empty())
            }
            _ => false,
        },
        Scope::User { user_id } => match body {
            EntityBody::Project(p) => p.assigned_user_ids.contains(&user_id),
            _ => false,
        },
        Scope::Project(id) => body.project_id() == Some(id),
        Scope::Location(id) => body.reference(EntityKind::Location) == Some(id),
        Scope::Room(id) => body.reference(EntityKind::Room) == Some(id),
        Scope::Conversation(id) => body.reference(EntityKind::SupportConversation) == Some(id),
    }
}

/// In-memory fake of the remote API.
///
/// Assigns ids, honours idempotency keys, enforces lock tokens, keeps
/// tombstones for the deleted-records endpoint and stamps responses from a
/// controllable clock that advances one second per mutation.
pub struct MemoryRemote {
    state: Mutex<ServerState>,
}

impl MemoryRemote {
    /// Create an empty server with its clock at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        let clock = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self {
            state: Mutex::new(ServerState {
                rows: BTreeMap::new(),
                next_id: 1000,
                idempotency: HashMap::new(),
                clock,
                page_size: 25,
                send_date_header: true,
                failures: VecDeque::new(),
                create_calls: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> ApiResult<()> {
        match self.state().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Make the next call fail with `err`. Queued failures apply in order.
    pub fn fail_next(&self, err: ApiError) {
        self.state().failures.push_back(err);
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size.max(1);
    }

    pub fn set_send_date_header(&self, send: bool) {
        self.state().send_date_header = send;
    }

    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state().clock = now;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().clock
    }

    /// Id handed to the next created or seeded row.
    pub fn set_next_id(&self, id: i64) {
        self.state().next_id = id - 1;
    }

    /// Number of create calls received, duplicates included.
    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    /// Create a row as if another client had done so.
    pub fn seed(&self, body: EntityBody) -> RemoteRecord {
        let mut state = self.state();
        let now = state.tick();
        state.next_id += 1;
        let record = RemoteRecord {
            id: state.next_id,
            uuid: Some(Uuid::new_v4().to_string()),
            created_at: now,
            updated_at: now,
            body,
        };
        state.rows.insert(
            (record.body.kind(), record.id),
            Row {
                record: record.clone(),
                deleted_at: None,
            },
        );
        record
    }

    /// Modify a row as if another client had edited it.
    pub fn edit(&self, kind: EntityKind, id: i64, f: impl FnOnce(&mut EntityBody)) -> Option<RemoteRecord> {
        let mut state = self.state();
        let now = state.tick();
        let row = state.rows.get_mut(&(kind, id))?;
        f(&mut row.record.body);
        row.record.updated_at = now;
        Some(row.record.clone())
    }

    /// Tombstone a row as if another client had deleted it.
    pub fn remove(&self, kind: EntityKind, id: i64) -> bool {
        let mut state = self.state();
        let now = state.tick();
        match state.rows.get_mut(&(kind, id)) {
            Some(row) if row.deleted_at.is_none() => {
                row.deleted_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// A live row.
    pub fn record(&self, kind: EntityKind, id: i64) -> Option<RemoteRecord> {
        let state = self.state();
        state.live(kind, id).ok().map(|row| row.record.clone())
    }

    /// All live rows of a kind.
    pub fn records(&self, kind: EntityKind) -> Vec<RemoteRecord> {
        self.state()
            .rows
            .range((kind, i64::MIN)..=(kind, i64::MAX))
            .filter(|(_, row)| row.deleted_at.is_none())
            .map(|(_, row)| row.record.clone())
            .collect()
    }
}

impl MemoryRemote {
    /// Serialize rows, tombstones, idempotency keys and the clock to JSON.
    pub fn to_json(&self) -> Result<String> {
        let state = self.state();
        let snapshot = ServerSnapshot {
            rows: state.rows.values().cloned().collect(),
            next_id: state.next_id,
            idempotency: state
                .idempotency
                .iter()
                .map(|(key, (kind, id))| (key.clone(), *kind, *id))
                .collect(),
            clock: state.clock,
        };
        serde_json::to_string_pretty(&snapshot).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Rebuild a server from JSON produced by [`MemoryRemote::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: ServerSnapshot =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let remote = Self::new();
        {
            let mut state = remote.state();
            state.rows = snapshot
                .rows
                .into_iter()
                .map(|row| ((row.record.body.kind(), row.record.id), row))
                .collect();
            state.next_id = snapshot.next_id;
            state.idempotency = snapshot
                .idempotency
                .into_iter()
                .map(|(key, kind, id)| (key, (kind, id)))
                .collect();
            state.clock = snapshot.clock;
        }
        Ok(remote)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        debug!("Saved server snapshot to {}", path.display());
        Ok(())
    }

    /// Load a snapshot file, or a fresh server if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn list(&self, query: &ListQuery) -> ApiResult<Page<RemoteRecord>> {
        self.take_failure()?;
        let state = self.state();

        let since = match &query.updated_since {
            Some(raw) => Some(
                parse_api_timestamp(raw)
                    .ok_or_else(|| ApiError::http(422, format!("bad updated_since {}", raw)))?,
            ),
            None => None,
        };

        let matching: Vec<RemoteRecord> = state
            .rows
            .range((query.kind, i64::MIN)..=(query.kind, i64::MAX))
            .map(|(_, row)| row)
            .filter(|row| row.deleted_at.is_none())
            .filter(|row| matches_scope(&row.record.body, query.scope))
            .filter(|row| since.map_or(true, |s| row.record.updated_at >= s))
            .map(|row| row.record.clone())
            .collect();

        let page_size = query.limit.map(|l| l as usize).unwrap_or(state.page_size).max(1);
        let last_page = matching.len().div_ceil(page_size).max(1) as u32;
        let page = query.page.max(1);
        let data = matching
            .into_iter()
            .skip((page as usize - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(Page {
            data,
            meta: Some(PageMeta {
                current_page: Some(page),
                last_page: Some(last_page),
            }),
        })
    }

    async fn get(&self, kind: EntityKind, server_id: i64) -> ApiResult<RemoteRecord> {
        self.take_failure()?;
        let state = self.state();
        state.live(kind, server_id).map(|row| row.record.clone())
    }

    async fn create(
        &self,
        kind: EntityKind,
        uuid: &str,
        body: &EntityBody,
        idempotency_key: &str,
    ) -> ApiResult<RemoteRecord> {
        self.take_failure()?;
        let mut state = self.state();
        state.create_calls += 1;

        if body.kind() != kind {
            return Err(ApiError::http(422, format!("body is not a {}", kind)));
        }
        if let Some((parent, id)) = body.references().into_iter().find(|(_, id)| *id <= 0) {
            return Err(ApiError::http(
                422,
                format!("unresolved {} reference {}", parent, id),
            ));
        }
        if let Some(existing) = state.idempotency.get(idempotency_key).copied() {
            debug!("Replaying idempotent create {}", idempotency_key);
            return state.live(existing.0, existing.1).map(|row| row.record.clone());
        }

        let now = state.tick();
        state.next_id += 1;
        let record = RemoteRecord {
            id: state.next_id,
            uuid: Some(uuid.to_string()),
            created_at: now,
            updated_at: now,
            body: body.clone(),
        };
        state.rows.insert(
            (kind, record.id),
            Row {
                record: record.clone(),
                deleted_at: None,
            },
        );
        state
            .idempotency
            .insert(idempotency_key.to_string(), (kind, record.id));
        Ok(record)
    }

    async fn update(
        &self,
        kind: EntityKind,
        server_id: i64,
        body: &EntityBody,
        lock_updated_at: &str,
    ) -> ApiResult<RemoteRecord> {
        self.take_failure()?;
        let mut state = self.state();
        state.check_lock(kind, server_id, lock_updated_at)?;
        if let Some((parent, id)) = body.references().into_iter().find(|(_, id)| *id <= 0) {
            return Err(ApiError::http(
                422,
                format!("unresolved {} reference {}", parent, id),
            ));
        }

        let now = state.tick();
        let row = state
            .rows
            .get_mut(&(kind, server_id))
            .ok_or_else(|| ApiError::http(404, "not found"))?;
        row.record.body = body.clone();
        row.record.updated_at = now;
        Ok(row.record.clone())
    }

    async fn delete(&self, kind: EntityKind, server_id: i64, lock_updated_at: &str) -> ApiResult<()> {
        self.take_failure()?;
        let mut state = self.state();
        state.check_lock(kind, server_id, lock_updated_at)?;

        let now = state.tick();
        if let Some(row) = state.rows.get_mut(&(kind, server_id)) {
            row.deleted_at = Some(now);
        }
        Ok(())
    }

    async fn deleted_records(
        &self,
        since: &str,
        types: &[String],
    ) -> ApiResult<DatedResponse<DeletedRecords>> {
        self.take_failure()?;
        let state = self.state();
        let since = parse_api_timestamp(since)
            .ok_or_else(|| ApiError::http(422, format!("bad since {}", since)))?;

        let mut records = DeletedRecords::default();
        for ((kind, id), row) in &state.rows {
            if !row.deleted_at.map_or(false, |at| at >= since) {
                continue;
            }
            for type_name in types {
                if DeletedRecords::kind_for_type(type_name) == Some(*kind) {
                    records.push(type_name, *id);
                }
            }
        }

        Ok(DatedResponse {
            value: records,
            date_header: state
                .send_date_header
                .then(|| format_http_date(&state.clock)),
        })
    }
}
