//! Connectivity port.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the remote API is reachable.
pub trait NetworkMonitor: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Connectivity flag flipped by the host platform.
#[derive(Debug)]
pub struct SharedNetworkFlag {
    available: AtomicBool,
}

impl SharedNetworkFlag {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for SharedNetworkFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for SharedNetworkFlag {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
