//! Dependency-aware parallel task executor.
//!
//! Units of work are registered with the ids of the units they depend on and
//! executed in waves: every unit whose dependencies have all resolved runs
//! concurrently with its siblings. A failed dependency still counts as
//! resolved, so one broken unit never blocks the rest of a batch. Units that
//! can never become ready (unknown dependency ids) are abandoned and logged.
//!
//! The queue is single use: [`DependencySyncQueue::process_all`] consumes it.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use fieldsync_common::Result;

type Work = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Identifier returned by [`DependencySyncQueue::add_item`].
pub type ItemId = usize;

struct QueueItem {
    id: ItemId,
    name: String,
    depends_on: Vec<ItemId>,
    work: Work,
}

struct QueueState {
    pending: Vec<QueueItem>,
    completed: HashSet<ItemId>,
    failed: HashSet<ItemId>,
}

/// What happened to each unit of a processed queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Units that never became ready, with the names of their unresolved dependencies.
    pub abandoned: Vec<(String, Vec<String>)>,
    pub waves: usize,
}

impl DependencyReport {
    /// No failures and nothing abandoned.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

/// Single-use topological executor.
#[derive(Default)]
pub struct DependencySyncQueue {
    items: Vec<QueueItem>,
    names: HashMap<ItemId, String>,
    next_id: ItemId,
}

impl DependencySyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit of work.
    ///
    /// `depends_on` lists ids returned by earlier calls. An id that was never
    /// issued is permanently unsatisfied and leaves the unit abandoned.
    pub fn add_item<F, Fut>(&mut self, name: impl Into<String>, depends_on: &[ItemId], work: F) -> ItemId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let name = name.into();
        self.names.insert(id, name.clone());
        self.items.push(QueueItem {
            id,
            name,
            depends_on: depends_on.to_vec(),
            work: Box::new(move || work().boxed()),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every unit; `true` iff nothing failed and nothing was abandoned.
    pub async fn process_all(self) -> bool {
        self.process_all_with_report().await.is_success()
    }

    /// Run every unit and report the fate of each.
    pub async fn process_all_with_report(self) -> DependencyReport {
        let names = self.names;
        let state = Arc::new(Mutex::new(QueueState {
            pending: self.items,
            completed: HashSet::new(),
            failed: HashSet::new(),
        }));
        let mut waves = 0;

        loop {
            let ready: Vec<QueueItem> = {
                let mut guard = state.lock().await;
                let resolved: HashSet<ItemId> =
                    guard.completed.union(&guard.failed).copied().collect();
                let (ready, blocked): (Vec<_>, Vec<_>) = std::mem::take(&mut guard.pending)
                    .into_iter()
                    .partition(|item| item.depends_on.iter().all(|dep| resolved.contains(dep)));
                guard.pending = blocked;
                ready
            };

            if ready.is_empty() {
                break;
            }

            waves += 1;
            debug!(
                wave = waves,
                "Running {} ready items: {:?}",
                ready.len(),
                ready.iter().map(|item| item.name.as_str()).collect::<Vec<_>>()
            );

            let runs = ready.into_iter().map(|item| {
                let state = Arc::clone(&state);
                async move {
                    let QueueItem { id, name, work, .. } = item;
                    let outcome = AssertUnwindSafe(async move { work().await })
                        .catch_unwind()
                        .await;

                    let mut guard = state.lock().await;
                    match outcome {
                        Ok(Ok(())) => {
                            guard.completed.insert(id);
                        }
                        Ok(Err(err)) => {
                            warn!(item = %name, "Dependency queue item failed: {}", err);
                            guard.failed.insert(id);
                        }
                        Err(_) => {
                            error!(item = %name, "Dependency queue item panicked");
                            guard.failed.insert(id);
                        }
                    }
                }
            });
            join_all(runs).await;
        }

        let guard = state.lock().await;
        let label = |id: &ItemId| names.get(id).cloned().unwrap_or_else(|| format!("#{}", id));

        let mut report = DependencyReport {
            waves,
            ..DependencyReport::default()
        };
        let mut ordered: Vec<&ItemId> = guard.completed.iter().collect();
        ordered.sort();
        report.completed = ordered.into_iter().map(label).collect();
        let mut ordered: Vec<&ItemId> = guard.failed.iter().collect();
        ordered.sort();
        report.failed = ordered.into_iter().map(label).collect();

        for item in &guard.pending {
            let missing: Vec<String> = item
                .depends_on
                .iter()
                .filter(|dep| !guard.completed.contains(*dep) && !guard.failed.contains(*dep))
                .map(label)
                .collect();
            warn!(
                item = %item.name,
                "Abandoning dependency queue item; unresolved dependencies: {:?}",
                missing
            );
            report.abandoned.push((item.name.clone(), missing));
        }

        info!(
            "Dependency queue finished: {} completed, {} failed, {} abandoned in {} waves",
            report.completed.len(),
            report.failed.len(),
            report.abandoned.len(),
            report.waves
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::Error;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn record(log: &Arc<StdMutex<Vec<String>>>, name: &str) {
        log.lock().unwrap().push(name.to_string());
    }

    #[tokio::test]
    async fn test_diamond_runs_in_three_waves() {
        let log = recorder();
        let mut queue = DependencySyncQueue::new();

        let l = log.clone();
        let a = queue.add_item("a", &[], move || async move {
            record(&l, "a");
            Ok(())
        });
        let l = log.clone();
        let c = queue.add_item("c", &[a], move || async move {
            record(&l, "c");
            Ok(())
        });
        let l = log.clone();
        let b = queue.add_item("b", &[a], move || async move {
            record(&l, "b");
            Ok(())
        });
        let l = log.clone();
        queue.add_item("d", &[b, c], move || async move {
            record(&l, "d");
            Ok(())
        });

        let report = queue.process_all_with_report().await;

        assert!(report.is_success());
        assert_eq!(report.waves, 3);
        let order = log.lock().unwrap().clone();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(order.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_dependency_unblocks_dependents() {
        let log = recorder();
        let mut queue = DependencySyncQueue::new();

        let a = queue.add_item("a", &[], || async {
            Err::<(), _>(Error::Network("down".to_string()))
        });
        let l = log.clone();
        let b = queue.add_item("b", &[a], move || async move {
            record(&l, "b");
            Ok(())
        });
        let l = log.clone();
        queue.add_item("d", &[a, b], move || async move {
            record(&l, "d");
            Ok(())
        });

        assert!(!queue.process_all().await);
        assert_eq!(*log.lock().unwrap(), vec!["b".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_abandoned() {
        let log = recorder();
        let mut queue = DependencySyncQueue::new();

        let l = log.clone();
        queue.add_item("orphan", &[99], move || async move {
            record(&l, "orphan");
            Ok(())
        });
        let l = log.clone();
        queue.add_item("fine", &[], move || async move {
            record(&l, "fine");
            Ok(())
        });

        let report = queue.process_all_with_report().await;

        assert!(!report.is_success());
        assert_eq!(report.completed, vec!["fine".to_string()]);
        assert_eq!(
            report.abandoned,
            vec![("orphan".to_string(), vec!["#99".to_string()])]
        );
        assert_eq!(*log.lock().unwrap(), vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let mut queue = DependencySyncQueue::new();
        let explode = true;
        let boom = queue.add_item("boom", &[], move || async move {
            if explode {
                panic!("unit exploded");
            }
            Ok(())
        });
        queue.add_item("after", &[boom], || async { Ok(()) });

        let report = queue.process_all_with_report().await;
        assert_eq!(report.failed, vec!["boom".to_string()]);
        assert_eq!(report.completed, vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_queue_succeeds() {
        assert!(DependencySyncQueue::new().process_all().await);
    }
}
