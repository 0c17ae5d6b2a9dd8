//! FieldSync Sync Engine
//!
//! Offline-first synchronization between the local store and the field-data
//! server, including:
//! - A durable outbound queue with retry and dependency backoff
//! - Optimistic-lock conflict detection and resolution
//! - Local-to-server id remapping after creates
//! - Checkpointed incremental pulls per entity collection
//! - Server-side deletion reconciliation
//! - Dependency-ordered metadata pulls and background scheduling

pub mod checkpoint;
pub mod conflict;
pub mod context;
pub mod deleted;
pub mod dependency;
pub mod engine;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod network;
pub mod outcome;
pub mod processor;
pub mod pull;
pub mod remap;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod state;

// Re-export main types
pub use conflict::{Resolution, ResolutionResult};
pub use context::SyncContext;
pub use deleted::{DeletedRecordsSyncService, DeletedSyncResult};
pub use dependency::{DependencyReport, DependencySyncQueue};
pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use handlers::{HandlerRegistry, PushHandler};
pub use metadata::{MetadataSyncResult, ProjectMetadataSyncService};
pub use metrics::SyncSessionMetrics;
pub use network::{NetworkMonitor, SharedNetworkFlag};
pub use outcome::{CreatedProject, OperationOutcome, PendingOperationResult};
pub use processor::SyncQueueProcessor;
pub use pull::PullStats;
pub use remap::{IdRemapService, RemapResult};
pub use retry::RetryConfig;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::QueueSummary;
