//! Shared handles every sync component works through.

use std::sync::Arc;

use fieldsync_common::LocalIdGenerator;
use fieldsync_remote::RemoteApi;
use fieldsync_storage::{CheckpointStore, LocalStore};

use crate::network::NetworkMonitor;

/// Collaborators of the sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub network: Arc<dyn NetworkMonitor>,
    pub ids: Arc<LocalIdGenerator>,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        checkpoints: Arc<dyn CheckpointStore>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            store,
            remote,
            checkpoints,
            network,
            ids: Arc::new(LocalIdGenerator::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.network.is_available()
    }
}
