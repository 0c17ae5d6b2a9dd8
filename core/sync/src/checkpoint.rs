//! Checkpoint keys, monotonic advancement and clock-skew clamping.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use fieldsync_common::time::{epoch, format_api_timestamp};
use fieldsync_common::Result;
use fieldsync_storage::CheckpointStore;

/// Watermark of the deleted-records endpoint.
pub const DELETED_RECORDS_KEY: &str = "deleted_records_global";
/// Last server clock reading taken from a `Date` header.
pub const SERVER_DATE_KEY: &str = "deleted_records_server_date";

pub fn company_projects_key(company_id: i64, assigned_only: bool) -> String {
    if assigned_only {
        format!("company_projects_{}_assigned", company_id)
    } else {
        format!("company_projects_{}", company_id)
    }
}

pub fn user_projects_key(user_id: i64) -> String {
    format!("user_projects_{}", user_id)
}

pub fn project_property_key(project_id: i64) -> String {
    format!("project_property_{}", project_id)
}

pub fn project_locations_key(project_id: i64) -> String {
    format!("project_locations_{}", project_id)
}

pub fn location_rooms_key(location_id: i64) -> String {
    format!("location_rooms_{}", location_id)
}

pub fn project_notes_key(project_id: i64) -> String {
    format!("project_notes_{}", project_id)
}

pub fn project_equipment_key(project_id: i64) -> String {
    format!("project_equipment_{}", project_id)
}

pub fn project_moisture_logs_key(project_id: i64) -> String {
    format!("project_moisture_logs_{}", project_id)
}

pub fn project_atmospheric_logs_key(project_id: i64) -> String {
    format!("project_atmospheric_logs_{}", project_id)
}

pub fn project_damages_key(project_id: i64) -> String {
    format!("project_damages_{}", project_id)
}

pub fn room_photos_key(room_id: i64) -> String {
    format!("room_photos_{}", room_id)
}

pub fn room_work_scopes_key(room_id: i64) -> String {
    format!("room_work_scopes_{}", room_id)
}

pub fn support_conversations_key(user_id: i64) -> String {
    format!("support_conversations_{}", user_id)
}

pub fn support_messages_key(conversation_id: i64) -> String {
    format!("support_messages_{}", conversation_id)
}

/// Read a checkpoint, clamping it if it lies in the future.
///
/// A checkpoint later than the last known server time is pulled back to
/// that time. Without a known server time, a checkpoint later than the
/// local clock is reset to the epoch. Either clamp is persisted.
pub async fn clamped_checkpoint(
    store: &dyn CheckpointStore,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(stored) = store.get(key).await? else {
        return Ok(None);
    };
    let server_time = store.get(SERVER_DATE_KEY).await?;

    let clamped = match server_time {
        Some(server) if stored > server => {
            warn!(
                checkpoint = key,
                "Future checkpoint {} clamped to last server time {} (device now {})",
                stored,
                server,
                now
            );
            server
        }
        None if stored > now => {
            warn!(
                checkpoint = key,
                "Future checkpoint {} with no server time; clamping to epoch (device now {})",
                stored,
                now
            );
            epoch()
        }
        _ => return Ok(Some(stored)),
    };

    store.set(key, clamped).await?;
    Ok(Some(clamped))
}

/// `updated_since` parameter for an incremental pull, or `None` for a full pull.
pub async fn since_param(store: &dyn CheckpointStore, key: &str) -> Result<Option<String>> {
    Ok(clamped_checkpoint(store, key, Utc::now())
        .await?
        .map(|ts| format_api_timestamp(&ts)))
}

/// Move a checkpoint forward to `candidate` if it is later than the stored value.
///
/// Returns whether the checkpoint changed.
pub async fn advance(
    store: &dyn CheckpointStore,
    key: &str,
    candidate: Option<DateTime<Utc>>,
) -> Result<bool> {
    let Some(candidate) = candidate else {
        return Ok(false);
    };
    match store.get(key).await? {
        Some(current) if current >= candidate => Ok(false),
        _ => {
            debug!(checkpoint = key, "Advancing checkpoint to {}", candidate);
            store.set(key, candidate).await?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use fieldsync_storage::MemoryCheckpointStore;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(company_projects_key(4, false), "company_projects_4");
        assert_eq!(company_projects_key(4, true), "company_projects_4_assigned");
        assert_eq!(user_projects_key(9), "user_projects_9");
        assert_eq!(project_notes_key(12), "project_notes_12");
    }

    #[tokio::test]
    async fn test_clamps_to_server_time() {
        let store = MemoryCheckpointStore::new();
        store.set(SERVER_DATE_KEY, at(10)).await.unwrap();
        store.set("k", at(12)).await.unwrap();

        let value = clamped_checkpoint(&store, "k", at(13)).await.unwrap();
        assert_eq!(value, Some(at(10)));
        assert_eq!(store.get("k").await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn test_no_clamp_when_not_strictly_after() {
        let store = MemoryCheckpointStore::new();
        store.set(SERVER_DATE_KEY, at(10)).await.unwrap();
        store.set("k", at(10)).await.unwrap();

        assert_eq!(clamped_checkpoint(&store, "k", at(1)).await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn test_clamps_to_epoch_without_server_time() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        store.set("k", now + Duration::days(2)).await.unwrap();

        let value = clamped_checkpoint(&store, "k", now).await.unwrap();
        assert_eq!(value, Some(epoch()));
        assert_eq!(store.get("k").await.unwrap(), Some(epoch()));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_means_full_pull() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(since_param(&store, "nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_never_regresses() {
        let store = MemoryCheckpointStore::new();
        assert!(advance(&store, "k", Some(at(5))).await.unwrap());
        assert!(!advance(&store, "k", Some(at(4))).await.unwrap());
        assert!(!advance(&store, "k", None).await.unwrap());
        assert!(advance(&store, "k", Some(at(6))).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(at(6)));
    }
}
