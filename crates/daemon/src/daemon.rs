//! Daemon startup and main loop for the fetch daemon
//!
//! Provides the daemon entry point, startup sequence, background tasks and
//! graceful shutdown.

use crate::config::{Config, ConfigError};
use crate::context::{OfferOutcome, RescanReport, ServerContext};
use crate::index::PersistenceError;
use crate::request::DownRequest;
use crate::runner::{Runner, SubprocessRunner};
use crate::scheduler::{Scheduler, TaskError};
use crate::startup::{prepare_directories, run_startup_checks, StartupError};
use crate::status_server::{run_status_server, ServerError};
use crate::worker::{drain_queue, supervise_worker};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Index could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Status server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// A scan or maintenance pass failed
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// A configured daemon, ready to run.
pub struct Daemon {
    ctx: Arc<ServerContext>,
    runner: Arc<dyn Runner>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides and validate
    /// 3. Run startup checks (downloader, directories)
    /// 4. Load the state index and recover the id counter
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an already loaded configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        let checked = config.clone();
        tokio::task::spawn_blocking(move || run_startup_checks(&checked))
            .await
            .map_err(TaskError::from)??;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the downloader binary is not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        prepare_directories(&config)?;
        let runner = Arc::new(SubprocessRunner::from_timeout_secs(
            config.supervisor.job_timeout_secs,
        ));
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ServerContext::new(config, cancel.clone())?);

        Ok(Self {
            ctx,
            runner,
            cancel,
        })
    }

    /// Replace the process runner, e.g. with a fake in tests
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self
    }

    /// Shared context of this daemon
    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Offer a single request, subject to the usual dedup rules
    pub async fn submit(&self, request: DownRequest) -> OfferOutcome {
        self.ctx.offer(request).await
    }

    /// Scan the input directories once
    pub async fn rescan(&self) -> Result<RescanReport, DaemonError> {
        Ok(self.ctx.rescan().await?)
    }

    fn start_periodic_tasks(&self, scheduler: &Scheduler) {
        let cfg = &self.ctx.config;

        let ctx = self.ctx.clone();
        scheduler.spawn_periodic(
            "rescan",
            Duration::from_secs(cfg.scan.rescan_interval_secs),
            true,
            move || {
                let ctx = ctx.clone();
                async move { ctx.rescan().await.map(|_| ()) }
            },
        );

        let ctx = self.ctx.clone();
        scheduler.spawn_periodic(
            "flush",
            Duration::from_secs(cfg.index.flush_interval_secs),
            false,
            move || {
                let ctx = ctx.clone();
                async move { ctx.flush_index().await.map(|_| ()).map_err(TaskError::from) }
            },
        );

        let ctx = self.ctx.clone();
        scheduler.spawn_periodic(
            "cleanup",
            Duration::from_secs(cfg.maintenance.cleanup_interval_secs),
            true,
            move || {
                let ctx = ctx.clone();
                async move { ctx.cleanup().await.map(|_| ()) }
            },
        );

        let ctx = self.ctx.clone();
        scheduler.spawn_periodic(
            "summary",
            Duration::from_secs(cfg.maintenance.summary_interval_secs),
            false,
            move || {
                let ctx = ctx.clone();
                async move {
                    ctx.summarize().await;
                    Ok(())
                }
            },
        );
    }

    /// Rescans early whenever the worker reports an empty queue.
    fn start_refill_task(&self) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ctx.refill_requested() => {}
                }
                if let Err(e) = ctx.rescan().await {
                    tracing::error!(error = %e, "refill rescan failed");
                }
            }
        })
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    fn start_status_server(&self) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(ctx, cancel).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    }

    /// Run the daemon until the shutdown token is cancelled
    ///
    /// Starts the worker supervisor, periodic tasks and the status server,
    /// then waits for shutdown and flushes the index one last time.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let next_rid = self.ctx.index.lock().await.next_rid();
        tracing::info!(
            output = %self.ctx.output_root().display(),
            scan_dirs = self.ctx.config.paths.scan_dirs.len(),
            next_rid,
            "daemon starting"
        );

        let scheduler = Scheduler::new(self.cancel.clone());
        self.start_periodic_tasks(&scheduler);
        let worker = tokio::spawn(supervise_worker(self.ctx.clone(), self.runner.clone()));
        let refill = self.start_refill_task();
        let server = self.start_status_server();

        self.cancel.cancelled().await;
        tracing::info!("shutdown requested");

        scheduler.shutdown().await;
        for (name, handle) in [("worker", worker), ("refill", refill), ("status server", server)] {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "task ended abnormally");
            }
        }

        self.ctx.flush_index().await?;
        tracing::info!("daemon stopped");
        Ok(())
    }

    /// Scan, download everything found, flush and return
    ///
    /// Rescans after each drained batch so requests deferred by a full queue
    /// are picked up, until a pass finds nothing new.
    pub async fn run_once(&self) -> Result<usize, DaemonError> {
        let mut total = 0;
        let first = self.ctx.rescan().await?;
        let max_pending = self.ctx.queue.max_pending();
        let max_rounds = first.discovered.div_ceil(max_pending) + 1;

        let mut report = first;
        for round in 1..=max_rounds {
            total += drain_queue(&self.ctx, self.runner.as_ref()).await;
            if report.deferred == 0 || self.ctx.is_shutting_down() {
                break;
            }
            if round < max_rounds {
                report = self.ctx.rescan().await?;
            }
        }

        self.ctx.flush_index().await?;
        tracing::info!(jobs = total, "single pass complete");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::runner::{ProcessOutput, RunError};
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct MediaRunner;

    #[async_trait]
    impl Runner for MediaRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunError> {
            let pos = spec.args.iter().position(|a| a == "-P").unwrap_or(0);
            let dir = PathBuf::from(&spec.args[pos + 1]);
            File::create(dir.join("video.webm"))?.set_len(150_000)?;
            Ok(ProcessOutput::default())
        }
    }

    fn create_test_config(temp_dir: &TempDir, max_pending: usize) -> Config {
        let mut config = Config::default();
        config.paths.work_dir = temp_dir.path().join("work");
        config.paths.scan_dirs = vec![temp_dir.path().join("in")];
        config.queue.max_pending = max_pending;
        config.status.bind = String::new();
        fs::create_dir_all(temp_dir.path().join("in")).unwrap();
        config
    }

    fn write_input(temp_dir: &TempDir, name: &str, ids: &[&str]) {
        let body: String = ids
            .iter()
            .map(|id| format!("https://www.youtube.com/watch?v={}\n", id))
            .collect();
        fs::write(temp_dir.path().join("in").join(name), body).unwrap();
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir, 3);
        let daemon = Daemon::new_without_checks(config.clone()).unwrap();

        assert_eq!(daemon.context().config, config);
        assert!(config.output_dir().is_dir());
        assert!(!daemon.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_exclude_pattern_fails_startup() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir, 3);
        config.scan.exclude_pattern = "(".to_string();

        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_run_once_processes_deferred_requests() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir, 2);
        write_input(&temp_dir, "480p.txt", &["aaa111", "bbb222", "ccc333", "ddd444", "eee555"]);

        let daemon = Daemon::new_without_checks(config.clone())
            .unwrap()
            .with_runner(Arc::new(MediaRunner));

        assert_eq!(daemon.run_once().await.unwrap(), 5);
        assert!(config.index_file().exists());

        let ctx = daemon.context();
        let index = ctx.index.lock().await;
        assert_eq!(index.counts().ok, 5);
        assert_eq!(index.next_rid(), 6);
    }

    #[tokio::test]
    async fn test_run_once_twice_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir, 3);
        write_input(&temp_dir, "720p.txt", &["abc123"]);

        let daemon = Daemon::new_without_checks(config.clone())
            .unwrap()
            .with_runner(Arc::new(MediaRunner));
        assert_eq!(daemon.run_once().await.unwrap(), 1);

        // A fresh daemon reloads the index and skips the finished request.
        let daemon = Daemon::new_without_checks(config)
            .unwrap()
            .with_runner(Arc::new(MediaRunner));
        assert_eq!(daemon.run_once().await.unwrap(), 0);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_send() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&temp_dir, 3)).unwrap();
        let run = daemon.run();
        assert_send(&run);
        let once = daemon.run_once();
        assert_send(&once);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir, 3);
        write_input(&temp_dir, "1080p.txt", &["abc123", "def456"]);

        let daemon = Arc::new(
            Daemon::new_without_checks(config.clone())
                .unwrap()
                .with_runner(Arc::new(MediaRunner)),
        );
        let token = daemon.shutdown_token();
        let running = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };

        let ctx = daemon.context();
        tokio::time::timeout(Duration::from_secs(10), async {
            while ctx.index.lock().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("both downloads should finish");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let persisted = fs::read_to_string(config.index_file()).unwrap();
        assert!(persisted.contains("abc123"));
        assert!(persisted.contains("def456"));
    }
}
