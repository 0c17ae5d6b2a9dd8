//! Common types used throughout FieldSync.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Every kind of record the engine knows how to store or sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Property,
    Location,
    Room,
    Note,
    Equipment,
    MoistureLog,
    AtmosphericLog,
    Photo,
    Album,
    Damage,
    WorkScope,
    SupportCategory,
    SupportConversation,
    SupportMessage,
}

impl EntityKind {
    /// All kinds, parents before children.
    pub const ALL: [EntityKind; 15] = [
        EntityKind::Project,
        EntityKind::Property,
        EntityKind::Location,
        EntityKind::Room,
        EntityKind::Note,
        EntityKind::Equipment,
        EntityKind::MoistureLog,
        EntityKind::AtmosphericLog,
        EntityKind::Photo,
        EntityKind::Album,
        EntityKind::Damage,
        EntityKind::WorkScope,
        EntityKind::SupportCategory,
        EntityKind::SupportConversation,
        EntityKind::SupportMessage,
    ];

    /// Stable lowercase name used in operation ids and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Property => "property",
            EntityKind::Location => "location",
            EntityKind::Room => "room",
            EntityKind::Note => "note",
            EntityKind::Equipment => "equipment",
            EntityKind::MoistureLog => "moisture_log",
            EntityKind::AtmosphericLog => "atmospheric_log",
            EntityKind::Photo => "photo",
            EntityKind::Album => "album",
            EntityKind::Damage => "damage",
            EntityKind::WorkScope => "work_scope",
            EntityKind::SupportCategory => "support_category",
            EntityKind::SupportConversation => "support_conversation",
            EntityKind::SupportMessage => "support_message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown entity type: {}", s)))
    }
}

/// Whether an identifier was minted locally and has not been replaced by a server id.
pub fn is_local_id(id: i64) -> bool {
    id < 0
}

/// Mints local identifiers for records created while offline.
///
/// Identifiers are the negated wall clock in milliseconds, forced to be strictly
/// decreasing so two records created within the same millisecond never collide.
/// Server identifiers are positive, so the two spaces never overlap.
#[derive(Debug, Default)]
pub struct LocalIdGenerator {
    last: AtomicI64,
}

impl LocalIdGenerator {
    /// Create a generator with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next local identifier. Always negative and lower than any previous value.
    pub fn next_id(&self) -> i64 {
        let candidate = -Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.min(prev - 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Make every later identifier lower than `id`.
    pub fn advance_past(&self, id: i64) {
        self.last.fetch_min(id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_kind_serde_matches_name() {
        let json = serde_json::to_string(&EntityKind::MoistureLog).unwrap();
        assert_eq!(json, "\"moisture_log\"");
    }

    #[test]
    fn test_local_ids_strictly_decrease() {
        let ids = LocalIdGenerator::new();
        let mut previous = ids.next_id();
        assert!(is_local_id(previous));
        for _ in 0..1000 {
            let id = ids.next_id();
            assert!(id < previous);
            previous = id;
        }
    }

    #[test]
    fn test_advance_past_lowers_next_id() {
        let ids = LocalIdGenerator::new();
        let floor = -Utc::now().timestamp_millis() - 3_600_000;
        ids.advance_past(floor);
        assert_eq!(ids.next_id(), floor - 1);
        // Never moves back up.
        ids.advance_past(-5);
        assert!(ids.next_id() < floor - 1);
    }
}
