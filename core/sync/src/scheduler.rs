//! Sync scheduling - manual, on-demand, periodic and hybrid modes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

use crate::engine::SyncReport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when asked.
    Manual,
    /// Sync as soon as local changes are reported.
    OnDemand,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn reacts_to_changes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Manual
    }
}

/// Work the scheduler can be asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Push pending operations, reconcile deletions, pull the project list.
    Cycle,
    /// Pull one project's essentials and metadata.
    Project(i64),
    /// Connectivity came back: reset failed operations and push.
    NetworkRestored,
    /// Stop the scheduler.
    Shutdown,
}

type Envelope = (SyncRequest, oneshot::Sender<Result<SyncReport>>);

/// Front end for requesting syncs from the background task.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };
        (scheduler, handle)
    }

    /// Run a full cycle and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Cycle).await
    }

    pub async fn request_project_sync(&self, project_id: i64) -> Result<SyncReport> {
        self.request(SyncRequest::Project(project_id)).await
    }

    pub async fn network_restored(&self) -> Result<SyncReport> {
        self.request(SyncRequest::NetworkRestored).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Cancelled("Scheduler dropped the sync request".to_string()))?
    }

    /// Report a local change. Triggers a cycle in on-demand and hybrid modes.
    pub async fn notify_change(&self) {
        let mode = self.mode.read().await.clone();
        if !mode.reacts_to_changes() {
            debug!("Change notification ignored (mode: {:?})", mode);
            return;
        }
        let (response_tx, _) = oneshot::channel();
        if self
            .request_tx
            .send((SyncRequest::Cycle, response_tx))
            .await
            .is_err()
        {
            debug!("Change notification dropped: scheduler not running");
        }
    }

    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// `sync_fn` performs the requested work. Outside manual mode, a cycle
    /// also runs when the periodic interval elapses and when the earliest
    /// backoff-scheduled operation reported by the last run becomes due.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = current_interval.map(periodic);
        let mut next_due: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            let automatic = *self.mode.read().await != SyncMode::Manual;
            let (request, response_tx) = tokio::select! {
                received = self.request_rx.recv() => match received {
                    Some((SyncRequest::Shutdown, _)) | None => {
                        info!("Received shutdown request");
                        break;
                    }
                    Some((request, response_tx)) => (request, Some(response_tx)),
                },
                _ = wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    (SyncRequest::Cycle, None)
                },
                _ = wait_until(next_due), if automatic && next_due.is_some() => {
                    debug!("Backoff expired; triggering sync");
                    (SyncRequest::Cycle, None)
                },
            };

            let result = sync_fn(request.clone()).await;
            next_due = match &result {
                Ok(report) => report.next_scheduled_at.map(|at| {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    Instant::now() + wait
                }),
                Err(_) => None,
            };
            match (&result, response_tx.is_some()) {
                (Ok(report), false) => info!("Scheduled {:?} finished: {}", request, report.summary()),
                (Err(e), false) => error!("Scheduled {:?} failed: {}", request, e),
                _ => {}
            }
            if let Some(response_tx) = response_tx {
                let _ = response_tx.send(result);
            }

            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                current_interval = expected;
                ticker = expected.map(periodic);
            }
        }
    }
}

fn periodic(every: Duration) -> Interval {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
