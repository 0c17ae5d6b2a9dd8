//! Remote API trait and wire types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::EntityKind;
use fieldsync_storage::EntityBody;

use crate::error::ApiResult;

/// Pagination metadata. Either field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub current_page: Option<u32>,
    pub last_page: Option<u32>,
}

/// One page of a list endpoint: `{ data: [...], meta?: {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub meta: Option<PageMeta>,
}

impl<T> Page<T> {
    /// A response without pagination metadata.
    pub fn single(data: Vec<T>) -> Self {
        Self { data, meta: None }
    }
}

/// A server-side entity. References inside `body` are server ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: i64,
    pub uuid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub body: EntityBody,
}

/// Which collection a list call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everything of the kind, e.g. support categories.
    Global,
    Company { company_id: i64, assigned_only: bool },
    User { user_id: i64 },
    Project(i64),
    Location(i64),
    Room(i64),
    Conversation(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub kind: EntityKind,
    pub scope: Scope,
    /// 1-based page number.
    pub page: u32,
    pub limit: Option<u32>,
    /// Only rows updated at or after this API timestamp.
    pub updated_since: Option<String>,
}

impl ListQuery {
    pub fn new(kind: EntityKind, scope: Scope) -> Self {
        Self {
            kind,
            scope,
            page: 1,
            limit: None,
            updated_since: None,
        }
    }

    pub fn updated_since(mut self, since: Option<String>) -> Self {
        self.updated_since = since;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page(&self, page: u32) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }
}

/// Ids removed server-side since a point in time, grouped by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletedRecords {
    pub projects: Vec<i64>,
    pub properties: Vec<i64>,
    pub photos: Vec<i64>,
    pub notes: Vec<i64>,
    pub rooms: Vec<i64>,
    pub locations: Vec<i64>,
    pub equipment: Vec<i64>,
    pub damage_materials: Vec<i64>,
    pub damage_material_room_logs: Vec<i64>,
    pub moisture_logs: Vec<i64>,
    pub atmospheric_logs: Vec<i64>,
    pub work_scope_actions: Vec<i64>,
}

impl DeletedRecords {
    /// Local kind a deleted-records type name maps to.
    pub fn kind_for_type(type_name: &str) -> Option<EntityKind> {
        match type_name {
            "projects" => Some(EntityKind::Project),
            "properties" => Some(EntityKind::Property),
            "photos" => Some(EntityKind::Photo),
            "notes" => Some(EntityKind::Note),
            "rooms" => Some(EntityKind::Room),
            "locations" => Some(EntityKind::Location),
            "equipment" => Some(EntityKind::Equipment),
            "damage_materials" => Some(EntityKind::Damage),
            "damage_material_room_logs" | "moisture_logs" => Some(EntityKind::MoistureLog),
            "atmospheric_logs" => Some(EntityKind::AtmosphericLog),
            "work_scope_actions" => Some(EntityKind::WorkScope),
            _ => None,
        }
    }

    fn list_mut(&mut self, type_name: &str) -> Option<&mut Vec<i64>> {
        match type_name {
            "projects" => Some(&mut self.projects),
            "properties" => Some(&mut self.properties),
            "photos" => Some(&mut self.photos),
            "notes" => Some(&mut self.notes),
            "rooms" => Some(&mut self.rooms),
            "locations" => Some(&mut self.locations),
            "equipment" => Some(&mut self.equipment),
            "damage_materials" => Some(&mut self.damage_materials),
            "damage_material_room_logs" => Some(&mut self.damage_material_room_logs),
            "moisture_logs" => Some(&mut self.moisture_logs),
            "atmospheric_logs" => Some(&mut self.atmospheric_logs),
            "work_scope_actions" => Some(&mut self.work_scope_actions),
            _ => None,
        }
    }

    /// Ids listed under a type name; empty for unknown names.
    pub fn ids_for_type(&self, type_name: &str) -> &[i64] {
        match type_name {
            "projects" => &self.projects,
            "properties" => &self.properties,
            "photos" => &self.photos,
            "notes" => &self.notes,
            "rooms" => &self.rooms,
            "locations" => &self.locations,
            "equipment" => &self.equipment,
            "damage_materials" => &self.damage_materials,
            "damage_material_room_logs" => &self.damage_material_room_logs,
            "moisture_logs" => &self.moisture_logs,
            "atmospheric_logs" => &self.atmospheric_logs,
            "work_scope_actions" => &self.work_scope_actions,
            _ => &[],
        }
    }

    /// Append an id under a type name. Unknown names are ignored.
    pub fn push(&mut self, type_name: &str, id: i64) {
        if let Some(list) = self.list_mut(type_name) {
            list.push(id);
        }
    }

    /// Moisture log ids from both lists that carry them, deduplicated.
    pub fn all_moisture_log_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .moisture_logs
            .iter()
            .chain(self.damage_material_room_logs.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
            && self.properties.is_empty()
            && self.photos.is_empty()
            && self.notes.is_empty()
            && self.rooms.is_empty()
            && self.locations.is_empty()
            && self.equipment.is_empty()
            && self.damage_materials.is_empty()
            && self.damage_material_room_logs.is_empty()
            && self.moisture_logs.is_empty()
            && self.atmospheric_logs.is_empty()
            && self.work_scope_actions.is_empty()
    }
}

/// A response body together with the raw `Date` header.
#[derive(Debug, Clone, PartialEq)]
pub struct DatedResponse<T> {
    pub value: T,
    pub date_header: Option<String>,
}

/// Remote API trait.
///
/// Implementations own transport concerns such as authentication and
/// timeouts. Every call may fail with a network error (`status == None`).
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch one page of a list endpoint.
    async fn list(&self, query: &ListQuery) -> ApiResult<Page<RemoteRecord>>;

    /// Fetch a single entity.
    ///
    /// # Errors
    /// - 404/410 if the entity does not exist
    async fn get(&self, kind: EntityKind, server_id: i64) -> ApiResult<RemoteRecord>;

    /// Create an entity.
    ///
    /// Re-submitting with the same `idempotency_key` returns the entity
    /// created by the first submission instead of a duplicate.
    async fn create(
        &self,
        kind: EntityKind,
        uuid: &str,
        body: &EntityBody,
        idempotency_key: &str,
    ) -> ApiResult<RemoteRecord>;

    /// Update an entity.
    ///
    /// # Errors
    /// - 409 if `lock_updated_at` does not match the server's `updated_at`
    async fn update(
        &self,
        kind: EntityKind,
        server_id: i64,
        body: &EntityBody,
        lock_updated_at: &str,
    ) -> ApiResult<RemoteRecord>;

    /// Delete an entity.
    ///
    /// # Errors
    /// - 409 on a stale lock token
    /// - 404/410 if already gone
    async fn delete(&self, kind: EntityKind, server_id: i64, lock_updated_at: &str)
        -> ApiResult<()>;

    /// Ids deleted since `since` for the requested type names.
    async fn deleted_records(
        &self,
        since: &str,
        types: &[String],
    ) -> ApiResult<DatedResponse<DeletedRecords>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_without_meta_deserializes() {
        let page: Page<i64> = serde_json::from_str(r#"{"data":[1,2]}"#).unwrap();
        assert_eq!(page.data, vec![1, 2]);
        assert!(page.meta.is_none());
    }

    #[test]
    fn test_deleted_records_partial_json() {
        let records: DeletedRecords =
            serde_json::from_str(r#"{"notes":[4],"moisture_logs":[7],"damage_material_room_logs":[7,8]}"#)
                .unwrap();
        assert_eq!(records.notes, vec![4]);
        assert_eq!(records.ids_for_type("notes"), &[4]);
        assert!(records.ids_for_type("albums").is_empty());
        assert_eq!(records.all_moisture_log_ids(), vec![7, 8]);
        assert!(!records.is_empty());
        assert!(DeletedRecords::default().is_empty());
    }

    #[test]
    fn test_type_name_mapping() {
        assert_eq!(DeletedRecords::kind_for_type("damage_materials"), Some(EntityKind::Damage));
        assert_eq!(
            DeletedRecords::kind_for_type("damage_material_room_logs"),
            Some(EntityKind::MoistureLog)
        );
        assert_eq!(DeletedRecords::kind_for_type("albums"), None);
    }
}
