//! CLI entry point for the fetch daemon
//!
//! Parses command line arguments, sets up logging and runs the daemon until
//! ctrl-c.

use clap::Parser;
use fetch_daemon::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Fetch Daemon - batch media downloads from watched request files
#[derive(Parser, Debug)]
#[command(name = "fetch-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (downloader binary). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Scan once, download everything found, then exit
    #[arg(long, default_value = "false")]
    once: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start(args: &Args) -> Result<Daemon, DaemonError> {
    if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        let config = Config::load(&args.config)?;
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(&args.config).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    tracing::info!(config = %args.config.display(), "fetch daemon starting");

    let daemon = match start(&args).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    let token = daemon.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("ctrl-c received");
                token.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let result = if args.once {
        daemon.run_once().await.map(|_| ())
    } else {
        daemon.run().await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}
