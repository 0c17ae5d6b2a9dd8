//! Durable outbound mutation queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldsync_common::{EntityKind, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

/// Queue state of an operation. Completed operations are removed, not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Pending,
    Failed,
    Conflict,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Conflict => "CONFLICT",
        }
    }
}

/// Drain priority; lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCreatePayload {
    pub local_project_id: i64,
    pub company_id: Option<i64>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyCreatePayload {
    pub property_local_id: i64,
    pub project_id: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUpdatePayload {
    pub project_id: i64,
    pub lock_updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCreatePayload {
    pub location_local_id: i64,
    pub location_uuid: String,
    pub project_id: i64,
    pub property_local_id: Option<i64>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreatePayload {
    pub room_local_id: i64,
    pub room_uuid: String,
    pub project_id: i64,
    pub level_server_id: Option<i64>,
    pub level_uuid: Option<String>,
    pub location_server_id: Option<i64>,
    pub location_uuid: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayload {
    pub idempotency_key: String,
}

/// Update or delete that only needs the lock token it was based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub lock_updated_at: Option<String>,
}

/// Type-specific body of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum OperationPayload {
    ProjectCreate(ProjectCreatePayload),
    PropertyCreate(PropertyCreatePayload),
    PropertyUpdate(PropertyUpdatePayload),
    LocationCreate(LocationCreatePayload),
    RoomCreate(RoomCreatePayload),
    Create(CreatePayload),
    Lock(LockPayload),
}

impl OperationPayload {
    pub fn lock(lock_updated_at: Option<String>) -> Self {
        OperationPayload::Lock(LockPayload { lock_updated_at })
    }

    pub fn create(idempotency_key: impl Into<String>) -> Self {
        OperationPayload::Create(CreatePayload {
            idempotency_key: idempotency_key.into(),
        })
    }

    pub fn lock_updated_at(&self) -> Option<&str> {
        match self {
            OperationPayload::PropertyUpdate(p) => p.lock_updated_at.as_deref(),
            OperationPayload::Lock(p) => p.lock_updated_at.as_deref(),
            _ => None,
        }
    }

    /// Replace the lock token of an update or delete payload.
    ///
    /// Returns `false` for payloads that carry no lock token.
    pub fn set_lock_updated_at(&mut self, lock: Option<String>) -> bool {
        match self {
            OperationPayload::PropertyUpdate(p) => {
                p.lock_updated_at = lock;
                true
            }
            OperationPayload::Lock(p) => {
                p.lock_updated_at = lock;
                true
            }
            _ => false,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            OperationPayload::ProjectCreate(p) => Some(&p.idempotency_key),
            OperationPayload::PropertyCreate(p) => Some(&p.idempotency_key),
            OperationPayload::LocationCreate(p) => Some(&p.idempotency_key),
            OperationPayload::RoomCreate(p) => Some(&p.idempotency_key),
            OperationPayload::Create(p) => Some(&p.idempotency_key),
            OperationPayload::PropertyUpdate(_) | OperationPayload::Lock(_) => None,
        }
    }

    /// Whether this payload shape is legal for the given entity and operation.
    pub fn is_valid_for(&self, kind: EntityKind, op: OperationType) -> bool {
        use EntityKind as K;

        match (op, self) {
            (OperationType::Create, OperationPayload::ProjectCreate(_)) => kind == K::Project,
            (OperationType::Create, OperationPayload::PropertyCreate(_)) => kind == K::Property,
            (OperationType::Create, OperationPayload::LocationCreate(_)) => kind == K::Location,
            (OperationType::Create, OperationPayload::RoomCreate(_)) => kind == K::Room,
            (OperationType::Create, OperationPayload::Create(_)) => matches!(
                kind,
                K::Note
                    | K::Equipment
                    | K::MoistureLog
                    | K::AtmosphericLog
                    | K::SupportConversation
                    | K::SupportMessage
            ),
            (OperationType::Update, OperationPayload::PropertyUpdate(_)) => kind == K::Property,
            (OperationType::Update, OperationPayload::Lock(_)) => matches!(
                kind,
                K::Project
                    | K::Location
                    | K::Room
                    | K::Note
                    | K::Equipment
                    | K::MoistureLog
                    | K::AtmosphericLog
            ),
            (OperationType::Delete, OperationPayload::Lock(_)) => matches!(
                kind,
                K::Project
                    | K::Property
                    | K::Location
                    | K::Room
                    | K::Note
                    | K::Equipment
                    | K::MoistureLog
                    | K::AtmosphericLog
                    | K::Photo
            ),
            _ => false,
        }
    }
}

/// One outbound mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub operation_id: String,
    pub entity_type: EntityKind,
    pub entity_id: i64,
    pub entity_uuid: String,
    pub operation_type: OperationType,
    pub payload: OperationPayload,
    pub priority: OperationPriority,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub skip_count: u32,
    pub max_skips: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest next attempt; `None` means due now.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PendingOperation {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_MAX_SKIPS: u32 = 10;

    /// Build a new pending operation.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload shape does not fit the entity and operation type
    pub fn new(
        entity_type: EntityKind,
        entity_id: i64,
        entity_uuid: impl Into<String>,
        operation_type: OperationType,
        payload: OperationPayload,
        priority: OperationPriority,
    ) -> Result<Self> {
        if !payload.is_valid_for(entity_type, operation_type) {
            return Err(Error::InvalidInput(format!(
                "{} payload is not valid for {} {}",
                payload_name(&payload),
                operation_type.as_str(),
                entity_type
            )));
        }

        Ok(Self {
            operation_id: format!("{}-{}-{}", entity_type, entity_id, Uuid::new_v4()),
            entity_type,
            entity_id,
            entity_uuid: entity_uuid.into(),
            operation_type,
            payload,
            priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            skip_count: 0,
            max_skips: Self::DEFAULT_MAX_SKIPS,
            created_at: Utc::now(),
            scheduled_at: None,
            last_attempt_at: None,
            error_message: None,
        })
    }

    pub fn with_limits(mut self, max_retries: u32, max_skips: u32) -> Self {
        self.max_retries = max_retries;
        self.max_skips = max_skips;
        self
    }

    /// Pending and not scheduled into the future.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.scheduled_at.map_or(true, |at| at <= now)
    }
}

fn payload_name(payload: &OperationPayload) -> &'static str {
    match payload {
        OperationPayload::ProjectCreate(_) => "project_create",
        OperationPayload::PropertyCreate(_) => "property_create",
        OperationPayload::PropertyUpdate(_) => "property_update",
        OperationPayload::LocationCreate(_) => "location_create",
        OperationPayload::RoomCreate(_) => "room_create",
        OperationPayload::Create(_) => "create",
        OperationPayload::Lock(_) => "lock",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_operation_defaults() {
        let op = PendingOperation::new(
            EntityKind::Note,
            -3,
            "u-1",
            OperationType::Create,
            OperationPayload::create("k-1"),
            OperationPriority::Medium,
        )
        .unwrap();

        assert!(op.operation_id.starts_with("note--3-"));
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.max_retries, 3);
        assert_eq!(op.payload.idempotency_key(), Some("k-1"));
        assert!(op.is_due(Utc::now()));
    }

    #[test]
    fn test_payload_validation() {
        let err = PendingOperation::new(
            EntityKind::Room,
            -3,
            "u-1",
            OperationType::Create,
            OperationPayload::create("k"),
            OperationPriority::High,
        );
        assert!(matches!(err, Err(Error::InvalidInput(_))));

        assert!(OperationPayload::lock(None).is_valid_for(EntityKind::Photo, OperationType::Delete));
        assert!(!OperationPayload::lock(None).is_valid_for(EntityKind::Photo, OperationType::Update));
        assert!(!OperationPayload::lock(None).is_valid_for(EntityKind::Album, OperationType::Delete));
    }

    #[test]
    fn test_is_due_respects_schedule_and_status() {
        let now = Utc::now();
        let mut op = PendingOperation::new(
            EntityKind::Room,
            5,
            "u",
            OperationType::Delete,
            OperationPayload::lock(Some("2024-01-01T00:00:00.000Z".into())),
            OperationPriority::Medium,
        )
        .unwrap();

        op.scheduled_at = Some(now + Duration::seconds(30));
        assert!(!op.is_due(now));
        assert!(op.is_due(now + Duration::seconds(30)));

        op.scheduled_at = None;
        op.status = OperationStatus::Failed;
        assert!(!op.is_due(now));
    }

    #[test]
    fn test_set_lock_only_on_lock_payloads() {
        let mut lock = OperationPayload::lock(None);
        assert!(lock.set_lock_updated_at(Some("2024-02-02T00:00:00.000Z".into())));
        assert_eq!(lock.lock_updated_at(), Some("2024-02-02T00:00:00.000Z"));

        let mut create = OperationPayload::create("k");
        assert!(!create.set_lock_updated_at(Some("x".into())));
        assert_eq!(create.lock_updated_at(), None);
    }

    #[test]
    fn test_priority_order() {
        assert!(OperationPriority::Critical < OperationPriority::High);
        assert!(OperationPriority::Medium < OperationPriority::Low);
    }
}
