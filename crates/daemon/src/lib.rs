//! Fetch Daemon
//!
//! Background service that discovers download requests in input directories,
//! runs them one at a time through an external downloader, and keeps a
//! persistent history of the results.

pub mod audit;
pub mod classify;
pub mod command;
pub mod context;
pub mod daemon;
pub mod index;
pub mod maintenance;
pub mod queue;
pub mod request;
pub mod runner;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod status_server;
pub mod worker;

pub use fetch_daemon_config as config;
pub use fetch_daemon_config::Config;
pub use classify::{classify_output_dir, Classification, ClassifyRules};
pub use command::{build_download_command, CommandSpec};
pub use context::{OfferOutcome, RescanReport, ServerContext, StatusSnapshot};
pub use daemon::{Daemon, DaemonError};
pub use index::{DownResult, IndexSettings, PersistenceError, StateIndex};
pub use queue::{EnqueueError, QueueState, RequestQueue};
pub use request::{DownRequest, RequestError};
pub use runner::{ProcessOutput, RunError, Runner, SubprocessRunner};
pub use scan::{scan_input_dirs, ScanError, ScanOutcome, ScanRules};
pub use scheduler::{Scheduler, TaskError};
pub use startup::{run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use worker::{run_job, supervise_worker};
