//! Per-session outcome counters for queue drains.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use fieldsync_common::EntityKind;
use fieldsync_storage::OperationType;

/// Outcome category recorded for one processed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricOutcome {
    Success,
    Failure,
    Skip,
    Drop,
    ConflictPending,
}

/// Counters for a single entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTypeMetrics {
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
    pub successes: u32,
    pub failures: u32,
    pub skips: u32,
    pub conflicts: u32,
    pub total_duration: Duration,
}

impl EntityTypeMetrics {
    pub fn total_operations(&self) -> u32 {
        self.creates + self.updates + self.deletes
    }
}

/// Metrics for one drain of the pending-operation queue.
#[derive(Debug, Clone)]
pub struct SyncSessionMetrics {
    pub session_id: String,
    started: Instant,
    ended: Option<Instant>,
    pub total: u32,
    pub successes: u32,
    pub failures: u32,
    pub skips: u32,
    pub drops: u32,
    pub conflicts: u32,
    by_type: BTreeMap<EntityKind, EntityTypeMetrics>,
}

impl SyncSessionMetrics {
    pub fn new() -> Self {
        let mut session_id = Uuid::new_v4().simple().to_string();
        session_id.truncate(8);
        Self {
            session_id,
            started: Instant::now(),
            ended: None,
            total: 0,
            successes: 0,
            failures: 0,
            skips: 0,
            drops: 0,
            conflicts: 0,
            by_type: BTreeMap::new(),
        }
    }

    pub fn record(
        &mut self,
        kind: EntityKind,
        operation: OperationType,
        outcome: MetricOutcome,
        duration: Duration,
    ) {
        self.total += 1;
        match outcome {
            MetricOutcome::Success => self.successes += 1,
            MetricOutcome::Failure => self.failures += 1,
            MetricOutcome::Skip => self.skips += 1,
            MetricOutcome::Drop => self.drops += 1,
            MetricOutcome::ConflictPending => self.conflicts += 1,
        }

        let entry = self.by_type.entry(kind).or_default();
        match operation {
            OperationType::Create => entry.creates += 1,
            OperationType::Update => entry.updates += 1,
            OperationType::Delete => entry.deletes += 1,
        }
        match outcome {
            MetricOutcome::Success => entry.successes += 1,
            MetricOutcome::Failure => entry.failures += 1,
            MetricOutcome::Skip => entry.skips += 1,
            // drops are only counted per session
            MetricOutcome::Drop => {}
            MetricOutcome::ConflictPending => entry.conflicts += 1,
        }
        entry.total_duration += duration;
    }

    pub fn for_type(&self, kind: EntityKind) -> Option<&EntityTypeMetrics> {
        self.by_type.get(&kind)
    }

    pub fn finish(&mut self) {
        self.ended.get_or_insert_with(Instant::now);
    }

    pub fn duration(&self) -> Duration {
        self.ended.unwrap_or_else(Instant::now) - self.started
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Sync session {}: {} ops in {}ms (success={}, failure={}, skip={}, drop={}, conflict={})",
            self.session_id,
            self.total,
            self.duration().as_millis(),
            self.successes,
            self.failures,
            self.skips,
            self.drops,
            self.conflicts
        );
        for (kind, m) in &self.by_type {
            let _ = write!(
                out,
                "\n  {}: c={} u={} d={} ok={} fail={} skip={} conflict={} {}ms",
                kind,
                m.creates,
                m.updates,
                m.deletes,
                m.successes,
                m.failures,
                m.skips,
                m.conflicts,
                m.total_duration.as_millis()
            );
        }
        out
    }

    pub fn log_summary(&self) {
        if self.total > 0 {
            info!("{}", self.summary());
        }
    }
}

impl Default for SyncSessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_by_type() {
        let mut metrics = SyncSessionMetrics::new();
        let tick = Duration::from_millis(5);
        metrics.record(EntityKind::Room, OperationType::Create, MetricOutcome::Success, tick);
        metrics.record(EntityKind::Room, OperationType::Update, MetricOutcome::ConflictPending, tick);
        metrics.record(EntityKind::Note, OperationType::Create, MetricOutcome::Skip, tick);
        metrics.record(EntityKind::Note, OperationType::Delete, MetricOutcome::Drop, tick);
        metrics.finish();

        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.drops, 1);
        let room = metrics.for_type(EntityKind::Room).unwrap();
        assert_eq!(room.total_operations(), 2);
        assert_eq!(room.conflicts, 1);
        assert_eq!(room.total_duration, Duration::from_millis(10));
        let note = metrics.for_type(EntityKind::Note).unwrap();
        assert_eq!(note.skips, 1);
        assert_eq!(note.deletes, 1);
        assert!(metrics.summary().contains("room: c=1 u=1"));
        assert_eq!(metrics.session_id.len(), 8);
    }
}
