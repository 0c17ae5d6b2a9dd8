//! Conflict records and resolution choices.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use fieldsync_common::{Error, Result};
use fieldsync_remote::ApiError;
use fieldsync_storage::{ConflictRecord, PendingOperation, Record};

/// Conflict type stored for a rejected lock token.
pub const STALE_LOCK: &str = "stale_lock";

/// How the user settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Resend the local change on top of the server's current version.
    KeepLocal,
    /// Discard the local change.
    KeepRemote,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep-local"),
            Resolution::KeepRemote => write!(f, "keep-remote"),
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-local" | "local" => Ok(Resolution::KeepLocal),
            "keep-remote" | "remote" => Ok(Resolution::KeepRemote),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution '{}', expected keep-local or keep-remote",
                other
            ))),
        }
    }
}

/// What resolving a conflict did to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionResult {
    /// The operation is pending again with a fresh lock token.
    Requeued { lock_updated_at: Option<String> },
    /// The operation was removed and the local row marked clean.
    Discarded,
}

/// Build the record kept for a stale-lock rejection.
///
/// The server's copy is taken from the error body when it parses as JSON.
pub fn stale_lock_conflict(
    op: &PendingOperation,
    local: Option<&Record>,
    err: &ApiError,
) -> Result<ConflictRecord> {
    let remote_version = err
        .body
        .as_deref()
        .and_then(|body| serde_json::from_str(body).ok())
        .unwrap_or(serde_json::Value::Null);
    let local_version = match local {
        Some(record) => serde_json::to_value(record)?,
        None => serde_json::Value::Null,
    };

    Ok(ConflictRecord {
        conflict_id: Uuid::new_v4().to_string(),
        operation_id: op.operation_id.clone(),
        entity_type: op.entity_type,
        entity_id: op.entity_id,
        entity_uuid: op.entity_uuid.clone(),
        local_version,
        remote_version,
        conflict_type: STALE_LOCK.to_string(),
        detected_at: Utc::now(),
        resolved_at: None,
    })
}
