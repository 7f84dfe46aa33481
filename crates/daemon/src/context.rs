//! Shared state handed to every task of a running daemon.

use crate::classify::ClassifyRules;
use crate::config::{Config, ConfigError};
use crate::index::{DownResult, IndexCounts, IndexSettings, PersistenceError, StateIndex};
use crate::maintenance::{log_summary, reclaim_space, ReclaimLimits, ReclaimReport};
use crate::queue::{EnqueueError, QueueSnapshot, RequestQueue};
use crate::request::{epoch_now, DownRequest};
use crate::scan::{scan_input_dirs, ScanRules};
use crate::scheduler::TaskError;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

/// Why an offered request was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    Excluded,
    QueuedOrRunning,
    RecentlyCompleted,
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateReason::Excluded => write!(f, "excluded"),
            DuplicateReason::QueuedOrRunning => write!(f, "queued or running"),
            DuplicateReason::RecentlyCompleted => write!(f, "recently completed"),
        }
    }
}

/// Result of offering a request to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Enqueued,
    Duplicate(DuplicateReason),
    /// Queue full; the request will be picked up again by a later rescan.
    Deferred,
}

/// Tallies of one rescan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    pub files_scanned: usize,
    pub discovered: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub errors: usize,
}

/// Monotonic counters since startup.
#[derive(Debug, Default)]
pub struct ContextStats {
    pub enqueued: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub deferred: AtomicU64,
    pub scan_errors: AtomicU64,
    pub worker_restarts: AtomicU64,
}

/// Counter values as served by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub duplicates_skipped: u64,
    pub deferred: u64,
    pub scan_errors: u64,
    pub worker_restarts: u64,
}

impl ContextStats {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            scan_errors: self.scan_errors.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Most recent finished job, as shown in the status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastResult {
    pub rid: Option<u64>,
    pub resource_key: String,
    pub ok: bool,
    pub return_code: i32,
    pub end_epoch: f64,
}

/// JSON body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub queue: QueueSnapshot,
    pub next_rid: u64,
    pub results: IndexCounts,
    pub last_result: Option<LastResult>,
    pub excluded_keys: usize,
    pub stats: StatsSnapshot,
    pub uptime_secs: u64,
}

/// State shared by the worker, the scheduler tasks and the status server.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub queue: RequestQueue,
    pub index: Mutex<StateIndex>,
    pub excluded: RwLock<HashSet<String>>,
    pub classify_rules: ClassifyRules,
    pub scan_rules: ScanRules,
    pub stats: ContextStats,
    cancel: CancellationToken,
    output_root: PathBuf,
    current_job_dir: RwLock<Option<PathBuf>>,
    last_summary_epoch: Mutex<f64>,
    started_epoch: f64,
    refill: Notify,
}

impl ServerContext {
    /// Builds the context, loading the index from disk.
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, ConfigError> {
        let output_root = config.output_dir();
        let index = StateIndex::load(
            config.index_file(),
            &output_root,
            IndexSettings::from(&config.index),
        );
        Self::with_index(config, index, cancel)
    }

    /// Builds the context around an already loaded index.
    pub fn with_index(
        config: Config,
        index: StateIndex,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let scan_rules = ScanRules::from_config(&config)?;
        let classify_rules = ClassifyRules::from(&config.classify);
        let now = epoch_now();

        Ok(Self {
            queue: RequestQueue::new(config.queue.max_pending),
            index: Mutex::new(index),
            excluded: RwLock::new(HashSet::new()),
            classify_rules,
            scan_rules,
            stats: ContextStats::default(),
            cancel,
            output_root: config.output_dir(),
            current_job_dir: RwLock::new(None),
            last_summary_epoch: Mutex::new(now),
            started_epoch: now,
            refill: Notify::new(),
            config,
        })
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Offers a request, applying every dedup rule before it may enter the queue.
    ///
    /// The index lock is held until the queue has answered so a result being
    /// recorded concurrently cannot slip between the two checks.
    pub async fn offer(&self, request: DownRequest) -> OfferOutcome {
        let key = request.resource_key.clone();

        if self.excluded.read().await.contains(&key) {
            return self.duplicate(&key, DuplicateReason::Excluded);
        }

        let index = self.index.lock().await;
        if index.blocks_retry(
            &key,
            epoch_now(),
            self.config.recency_window(),
            self.config.retry_failed_after(),
        ) {
            return self.duplicate(&key, DuplicateReason::RecentlyCompleted);
        }

        let outcome = match self.queue.try_enqueue(request).await {
            Ok(()) => {
                ContextStats::bump(&self.stats.enqueued, 1);
                tracing::info!(key = %key, "request enqueued");
                OfferOutcome::Enqueued
            }
            Err(EnqueueError::Duplicate(_)) => {
                return self.duplicate(&key, DuplicateReason::QueuedOrRunning)
            }
            Err(EnqueueError::Full { max_pending, .. }) => {
                ContextStats::bump(&self.stats.deferred, 1);
                tracing::debug!(key = %key, max_pending, "queue full, request deferred");
                OfferOutcome::Deferred
            }
        };
        drop(index);
        outcome
    }

    fn duplicate(&self, key: &str, reason: DuplicateReason) -> OfferOutcome {
        ContextStats::bump(&self.stats.duplicates_skipped, 1);
        tracing::trace!(key, %reason, "duplicate request skipped");
        OfferOutcome::Duplicate(reason)
    }

    /// Allocates an id for a job about to start and marks its directory busy.
    pub async fn begin_job(&self, job_dir_for: impl FnOnce(u64) -> PathBuf) -> (u64, PathBuf) {
        let rid = self.index.lock().await.allocate_rid();
        let dir = job_dir_for(rid);
        *self.current_job_dir.write().await = Some(dir.clone());
        (rid, dir)
    }

    /// Appends a finished job to the index, then releases its queue slot.
    pub async fn record_result(&self, result: DownResult) {
        let key = result.resource_key().to_string();
        let mut index = self.index.lock().await;
        if let Some(evicted) = index.append(result) {
            tracing::debug!(key = %evicted.resource_key(), rid = ?evicted.rid(), "evicted oldest result");
        }
        self.queue.finish(&key).await;
        drop(index);
        *self.current_job_dir.write().await = None;
    }

    /// Clears the running marker after the worker died mid-job.
    pub async fn abandon_running(&self) {
        if let Some(key) = self.queue.abandon_running().await {
            tracing::warn!(key = %key, "abandoned running job after worker failure");
        }
        *self.current_job_dir.write().await = None;
    }

    /// Asks for an early rescan, used when the queue has drained.
    pub fn request_refill(&self) {
        self.refill.notify_one();
    }

    /// Resolves once an early rescan was requested.
    pub async fn refill_requested(&self) {
        self.refill.notified().await
    }

    /// Scans the input directories and offers everything found.
    pub async fn rescan(&self) -> Result<RescanReport, TaskError> {
        let dirs = self.config.paths.scan_dirs.clone();
        let rules = self.scan_rules.clone();
        let outcome = tokio::task::spawn_blocking(move || scan_input_dirs(&dirs, &rules)).await?;

        for (path, error) in &outcome.errors {
            tracing::warn!(file = %path.display(), error = %error, "skipping input file");
        }
        ContextStats::bump(&self.stats.scan_errors, outcome.errors.len() as u64);

        *self.excluded.write().await = outcome.excluded_keys.into_iter().collect();

        let mut report = RescanReport {
            files_scanned: outcome.files_scanned,
            discovered: outcome.requests.len(),
            errors: outcome.errors.len(),
            ..Default::default()
        };
        for request in outcome.requests {
            match self.offer(request).await {
                OfferOutcome::Enqueued => report.enqueued += 1,
                OfferOutcome::Duplicate(_) => report.duplicates += 1,
                OfferOutcome::Deferred => report.deferred += 1,
            }
        }

        tracing::info!(
            files = report.files_scanned,
            discovered = report.discovered,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            deferred = report.deferred,
            errors = report.errors,
            "rescan complete"
        );
        Ok(report)
    }

    /// Persists the index if anything changed since the last save.
    pub async fn flush_index(&self) -> Result<bool, PersistenceError> {
        let mut index = self.index.lock().await;
        if !index.is_dirty() {
            return Ok(false);
        }
        index.save()?;
        tracing::debug!(index = %index.path().display(), results = index.len(), "index flushed");
        Ok(true)
    }

    /// Reclaims output space according to the maintenance limits.
    pub async fn cleanup(&self) -> Result<ReclaimReport, TaskError> {
        let limits = ReclaimLimits {
            max_output_bytes: self.config.maintenance.max_output_bytes,
            min_free_bytes: self.config.maintenance.min_free_bytes,
        };
        if limits.is_disabled() {
            return Ok(ReclaimReport::default());
        }

        let protected: HashSet<PathBuf> = self.current_job_dir.read().await.iter().cloned().collect();
        let root = self.output_root.clone();
        let report =
            tokio::task::spawn_blocking(move || reclaim_space(&root, &limits, &protected)).await??;

        if !report.removed.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                freed_bytes = report.freed_bytes,
                "output space reclaimed"
            );
        }
        Ok(report)
    }

    /// Logs ok/failed tallies since the previous summary.
    pub async fn summarize(&self) -> IndexCounts {
        let now = epoch_now();
        let mut last = self.last_summary_epoch.lock().await;
        let counts = self.index.lock().await.counts_since(*last);
        log_summary(&counts, (now - *last).max(0.0) as u64);
        *last = now;
        counts
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let queue = self.queue.snapshot().await;
        let (next_rid, results, last_result) = {
            let index = self.index.lock().await;
            let last = index.results().last().map(|r| LastResult {
                rid: r.rid(),
                resource_key: r.resource_key().to_string(),
                ok: r.ok,
                return_code: r.return_code,
                end_epoch: r.end_epoch,
            });
            (index.next_rid(), index.counts(), last)
        };

        StatusSnapshot {
            queue,
            next_rid,
            results,
            last_result,
            excluded_keys: self.excluded.read().await.len(),
            stats: self.stats.snapshot(),
            uptime_secs: (epoch_now() - self.started_epoch).max(0.0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueState;
    use std::fs;
    use tempfile::TempDir;

    fn context(temp_dir: &TempDir, max_pending: usize) -> ServerContext {
        let mut config = Config::default();
        config.paths.work_dir = temp_dir.path().to_path_buf();
        config.paths.scan_dirs = vec![temp_dir.path().join("in")];
        config.queue.max_pending = max_pending;
        fs::create_dir_all(temp_dir.path().join("in")).unwrap();
        ServerContext::new(config, CancellationToken::new()).unwrap()
    }

    fn req(id: &str) -> DownRequest {
        DownRequest::new(&format!("https://youtu.be/{}", id), 720, "720p.txt").unwrap()
    }

    fn finished(request: DownRequest, ok: bool) -> DownResult {
        let now = epoch_now();
        DownResult {
            ok,
            return_code: 0,
            url: request.url.clone(),
            request,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            media_files: Vec::new(),
            start_epoch: now,
            end_epoch: now,
        }
    }

    #[tokio::test]
    async fn test_offer_dedup_rules() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 3);

        assert_eq!(ctx.offer(req("a")).await, OfferOutcome::Enqueued);
        assert_eq!(
            ctx.offer(req("a")).await,
            OfferOutcome::Duplicate(DuplicateReason::QueuedOrRunning)
        );

        ctx.excluded.write().await.insert("x".to_string());
        assert_eq!(
            ctx.offer(req("x")).await,
            OfferOutcome::Duplicate(DuplicateReason::Excluded)
        );

        let running = ctx.queue.try_dequeue().await.unwrap();
        ctx.record_result(finished(running, true)).await;
        assert_eq!(ctx.queue.state().await, QueueState::Empty);
        assert_eq!(
            ctx.offer(req("a")).await,
            OfferOutcome::Duplicate(DuplicateReason::RecentlyCompleted)
        );

        assert_eq!(ctx.stats.snapshot().duplicates_skipped, 3);
    }

    #[tokio::test]
    async fn test_offer_defers_when_full() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 1);

        assert_eq!(ctx.offer(req("a")).await, OfferOutcome::Enqueued);
        assert_eq!(ctx.offer(req("b")).await, OfferOutcome::Deferred);
        assert_eq!(ctx.stats.snapshot().deferred, 1);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 10);
        fs::write(
            temp_dir.path().join("in").join("1080p.txt"),
            "https://youtu.be/abc123\nhttps://youtu.be/def456\n",
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("in").join("exclude.txt"),
            "def456\n",
        )
        .unwrap();

        let first = ctx.rescan().await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(first.duplicates, 1);

        let second = ctx.rescan().await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(ctx.queue.pending_keys().await, vec!["abc123"]);
        assert_eq!(ctx.status_snapshot().await.excluded_keys, 1);
    }

    #[tokio::test]
    async fn test_flush_only_when_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 3);

        assert!(!ctx.flush_index().await.unwrap());
        let (rid, dir) = ctx.begin_job(|rid| temp_dir.path().join(rid.to_string())).await;
        assert_eq!(rid, 1);
        assert!(dir.ends_with("1"));
        assert!(ctx.flush_index().await.unwrap());
        assert!(ctx.config.index_file().exists());
        assert!(!ctx.flush_index().await.unwrap());
    }

    #[tokio::test]
    async fn test_status_snapshot_reports_last_result() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 3);

        let mut request = req("abc123");
        request.rid = Some(5);
        ctx.record_result(finished(request, false)).await;

        let status = ctx.status_snapshot().await;
        assert_eq!(status.results.failed, 1);
        assert_eq!(status.next_rid, 6);
        let last = status.last_result.unwrap();
        assert_eq!(last.resource_key, "abc123");
        assert!(!last.ok);
    }
}
