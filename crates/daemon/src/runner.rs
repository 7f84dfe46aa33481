//! Process runner for downloader invocations.
//!
//! Runs one [`CommandSpec`] as a child process and hands back the exit code
//! with captured output. A non-zero exit is not an error here: whether a job
//! succeeded is decided later by inspecting its output directory.

use crate::command::CommandSpec;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error type for process execution
#[derive(Debug, Error)]
pub enum RunError {
    /// The child could not be started (missing binary, permissions).
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child or reading its output failed.
    #[error("IO error while running downloader: {0}")]
    Io(#[from] std::io::Error),

    /// The supervisory timeout expired and the child was killed.
    #[error("Downloader exceeded {0:?} and was killed")]
    TimedOut(Duration),
}

/// Exit code and captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, -1 when the process was terminated by a signal.
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes downloader commands.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    timeout: Option<Duration>,
}

impl SubprocessRunner {
    /// Runner relying only on the downloader's own timeout flags.
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Runner that kills the child after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Build from the configured job timeout in seconds (0 disables it).
    pub fn from_timeout_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::new()
        } else {
            Self::with_timeout(Duration::from_secs(secs))
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl Runner for SubprocessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunError> {
        let child = spec.to_command().spawn().map_err(|source| RunError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Dropping the wait future drops the child, and kill_on_drop reaps it.
        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result?,
                Err(_) => return Err(RunError::TimedOut(limit)),
            },
            None => wait.await?,
        };

        Ok(ProcessOutput {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
