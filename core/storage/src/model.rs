//! Local entity model.
//!
//! A [`Record`] carries the sync metadata every entity shares; the
//! kind-specific fields live in [`EntityBody`]. References between entities
//! hold the parent's server id once it is known and its local (negative) id
//! before that, so a reference can always be resolved against either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldsync_common::EntityKind;

/// Sync state of a single local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Local changes not yet acknowledged by the server.
    Pending,
    /// A push is in flight.
    Syncing,
    /// In sync with the server.
    Synced,
    /// The server rejected the change as stale.
    Conflict,
    /// Push gave up.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBody {
    pub company_id: Option<i64>,
    pub title: String,
    pub status: String,
    pub property_id: Option<i64>,
    #[serde(default)]
    pub assigned_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBody {
    pub project_id: i64,
    pub address: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBody {
    pub project_id: i64,
    pub property_id: Option<i64>,
    pub title: String,
    pub location_type: String,
    pub parent_location_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomBody {
    pub project_id: i64,
    pub location_id: Option<i64>,
    pub level_id: Option<i64>,
    pub title: String,
    pub room_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub content: String,
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub equipment_type: String,
    pub quantity: u32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoistureLogBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub material: String,
    pub reading: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtmosphericLogBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub relative_humidity: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub album_id: Option<i64>,
    pub file_name: String,
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub title: String,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkScopeBody {
    pub project_id: i64,
    pub room_id: Option<i64>,
    pub damage_id: Option<i64>,
    pub description: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportCategoryBody {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportConversationBody {
    pub category_id: Option<i64>,
    pub subject: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportMessageBody {
    pub conversation_id: i64,
    pub body: String,
    pub sender_id: Option<i64>,
}

/// Kind-specific content of a record. Also used as the wire body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityBody {
    Project(ProjectBody),
    Property(PropertyBody),
    Location(LocationBody),
    Room(RoomBody),
    Note(NoteBody),
    Equipment(EquipmentBody),
    MoistureLog(MoistureLogBody),
    AtmosphericLog(AtmosphericLogBody),
    Photo(PhotoBody),
    Album(AlbumBody),
    Damage(DamageBody),
    WorkScope(WorkScopeBody),
    SupportCategory(SupportCategoryBody),
    SupportConversation(SupportConversationBody),
    SupportMessage(SupportMessageBody),
}

impl EntityBody {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityBody::Project(_) => EntityKind::Project,
            EntityBody::Property(_) => EntityKind::Property,
            EntityBody::Location(_) => EntityKind::Location,
            EntityBody::Room(_) => EntityKind::Room,
            EntityBody::Note(_) => EntityKind::Note,
            EntityBody::Equipment(_) => EntityKind::Equipment,
            EntityBody::MoistureLog(_) => EntityKind::MoistureLog,
            EntityBody::AtmosphericLog(_) => EntityKind::AtmosphericLog,
            EntityBody::Photo(_) => EntityKind::Photo,
            EntityBody::Album(_) => EntityKind::Album,
            EntityBody::Damage(_) => EntityKind::Damage,
            EntityBody::WorkScope(_) => EntityKind::WorkScope,
            EntityBody::SupportCategory(_) => EntityKind::SupportCategory,
            EntityBody::SupportConversation(_) => EntityKind::SupportConversation,
            EntityBody::SupportMessage(_) => EntityKind::SupportMessage,
        }
    }

    /// Mutable handles on every populated reference, tagged with the parent kind.
    fn reference_slots(&mut self) -> Vec<(EntityKind, &mut i64)> {
        use EntityKind as K;

        let mut slots: Vec<(EntityKind, &mut i64)> = Vec::new();
        match self {
            EntityBody::Project(b) => {
                slots.extend(b.property_id.as_mut().map(|v| (K::Property, v)));
            }
            EntityBody::Property(b) => slots.push((K::Project, &mut b.project_id)),
            EntityBody::Location(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.property_id.as_mut().map(|v| (K::Property, v)));
                slots.extend(b.parent_location_id.as_mut().map(|v| (K::Location, v)));
            }
            EntityBody::Room(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.location_id.as_mut().map(|v| (K::Location, v)));
                slots.extend(b.level_id.as_mut().map(|v| (K::Location, v)));
            }
            EntityBody::Note(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::Equipment(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::MoistureLog(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::AtmosphericLog(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::Photo(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
                slots.extend(b.album_id.as_mut().map(|v| (K::Album, v)));
            }
            EntityBody::Album(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::Damage(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
            }
            EntityBody::WorkScope(b) => {
                slots.push((K::Project, &mut b.project_id));
                slots.extend(b.room_id.as_mut().map(|v| (K::Room, v)));
                slots.extend(b.damage_id.as_mut().map(|v| (K::Damage, v)));
            }
            EntityBody::SupportCategory(_) => {}
            EntityBody::SupportConversation(b) => {
                slots.extend(b.category_id.as_mut().map(|v| (K::SupportCategory, v)));
            }
            EntityBody::SupportMessage(b) => {
                slots.push((K::SupportConversation, &mut b.conversation_id));
            }
        }
        slots
    }

    /// Every populated reference as `(parent kind, id)`.
    pub fn references(&self) -> Vec<(EntityKind, i64)> {
        let mut copy = self.clone();
        copy.reference_slots()
            .into_iter()
            .map(|(kind, id)| (kind, *id))
            .collect()
    }

    /// First reference to a parent of the given kind.
    pub fn reference(&self, parent: EntityKind) -> Option<i64> {
        self.references()
            .into_iter()
            .find(|(kind, _)| *kind == parent)
            .map(|(_, id)| id)
    }

    /// Owning project reference, if the kind belongs to a project.
    pub fn project_id(&self) -> Option<i64> {
        self.reference(EntityKind::Project)
    }

    /// Rewrite every reference to `parent` equal to `old` so it points at `new`.
    ///
    /// Returns whether anything changed.
    pub fn remap_reference(&mut self, parent: EntityKind, old: i64, new: i64) -> bool {
        let mut changed = false;
        for (kind, slot) in self.reference_slots() {
            if kind == parent && *slot == old {
                *slot = new;
                changed = true;
            }
        }
        changed
    }
}

/// A locally stored entity with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Local identity. Negative when minted offline; stable for the record's lifetime.
    pub id: i64,
    /// Server identity, set once by the first successful create.
    pub server_id: Option<i64>,
    /// Permanent client-generated identity.
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    /// Server `updated_at` when synced, local edit time when dirty.
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub is_dirty: bool,
    pub is_deleted: bool,
    pub body: EntityBody,
}

impl Record {
    /// A record created on this device that the server has never seen.
    pub fn new_local(id: i64, body: EntityBody) -> Self {
        let now = Utc::now();
        Self {
            id,
            server_id: None,
            uuid: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            sync_status: SyncStatus::Pending,
            is_dirty: true,
            is_deleted: false,
            body,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    /// Whether `reference` names this record by local or server id.
    pub fn matches_id(&self, reference: i64) -> bool {
        self.id == reference || self.server_id == Some(reference)
    }

    /// Every id other records may use to reference this one.
    pub fn known_ids(&self) -> Vec<i64> {
        let mut ids = vec![self.id];
        ids.extend(self.server_id.filter(|server| *server != self.id));
        ids
    }

    /// The id children should store: the server id when known.
    pub fn reference_id(&self) -> i64 {
        self.server_id.unwrap_or(self.id)
    }

    /// Record a local edit.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.is_dirty = true;
        self.sync_status = SyncStatus::Pending;
    }

    /// Record server acknowledgement.
    pub fn mark_synced(&mut self, server_id: i64, server_updated_at: DateTime<Utc>) {
        self.server_id = Some(server_id);
        self.updated_at = server_updated_at;
        self.last_synced_at = Some(Utc::now());
        self.sync_status = SyncStatus::Synced;
        self.is_dirty = false;
    }

    /// Soft-delete without anything left to tell the server.
    pub fn mark_deleted_synced(&mut self) {
        self.is_deleted = true;
        self.is_dirty = false;
        self.sync_status = SyncStatus::Synced;
    }
}
