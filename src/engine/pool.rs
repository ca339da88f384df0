//! Per-message task set owned by an intake loop.

use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

/// Runs one task per work item and joins them on [`WorkerPool::drain`].
///
/// Finished tasks are reaped on every dispatch so the set only holds live
/// work. A panicking task is logged and otherwise ignored.
pub struct WorkerPool {
    name: &'static str,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: JoinSet::new(),
        }
    }

    /// Spawns `work` in the current span.
    pub fn dispatch<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.tasks.spawn(work.in_current_span());
    }

    /// Tasks dispatched and not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Joins tasks that have already finished without waiting.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.check(result);
        }
    }

    /// Waits for every dispatched task.
    pub async fn drain(&mut self) {
        let pending = self.tasks.len();
        if pending > 0 {
            tracing::debug!(pool = self.name, pending, "draining worker pool");
        }
        while let Some(result) = self.tasks.join_next().await {
            self.check(result);
        }
    }

    fn check(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!(pool = self.name, error = %e, "worker task panicked");
            } else {
                tracing::warn!(pool = self.name, error = %e, "worker task cancelled");
            }
        }
    }
}
