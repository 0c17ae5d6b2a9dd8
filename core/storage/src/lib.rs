//! Local persistence for FieldSync.
//!
//! This module provides the entity model, the durable pending-operation
//! queue, the [`LocalStore`] port the sync engine depends on, and the
//! checkpoint stores that hold incremental-pull watermarks.
//!
//! # Design Principles
//! - Port isolation: the engine only sees the [`LocalStore`] and [`CheckpointStore`] traits
//! - Async operations: all store calls are async
//! - One operation per entity: the queue is keyed by entity, never by operation
//! - Unified error semantics: every backend reports `fieldsync_common::Error`

pub mod checkpoint;
pub mod memory;
pub mod model;
pub mod queue;
pub mod store;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use memory::MemoryStore;
pub use model::{EntityBody, Record, SyncStatus};
pub use queue::{
    OperationPayload, OperationPriority, OperationStatus, OperationType, PendingOperation,
};
pub use store::{ConflictRecord, LocalStore};
