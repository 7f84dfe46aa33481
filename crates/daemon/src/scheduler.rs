//! Periodic background tasks.
//!
//! Each task runs on its own tokio task driven by `tokio::time::interval`
//! and stops when the shared cancellation token fires. A failing tick is
//! logged and the task keeps its schedule.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Error returned by a single run of a periodic task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::index::PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

/// Owner of all periodic tasks.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Runs `job` every `period`; a zero period disables the task.
    ///
    /// With `immediate` the first run happens right away, otherwise after one
    /// full period. Returns whether the task was started.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        immediate: bool,
        mut job: F,
    ) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if period.is_zero() {
            tracing::info!(task = name, "periodic task disabled");
            return false;
        }

        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let start = if immediate {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + period
            };
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(task = name, period_secs = period.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = job().await {
                    tracing::error!(task = name, error = %e, "periodic task failed");
                }
            }

            tracing::debug!(task = name, "periodic task stopped");
        });
        true
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancels every task and waits until all have returned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
