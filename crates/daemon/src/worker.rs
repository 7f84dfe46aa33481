//! The single download worker and its supervisor.
//!
//! Exactly one job runs at a time. Every failure inside a job (bad settings,
//! spawn errors, timeouts, missing media) ends up as a `DownResult` with
//! `ok == false`; the worker itself only stops on shutdown.

use crate::audit::{job_dir, write_audit_file};
use crate::classify::{classify_output_dir, compose_error_text, Classification};
use crate::command::build_download_command;
use crate::context::{ContextStats, ServerContext};
use crate::index::DownResult;
use crate::request::{epoch_now, DownRequest};
use crate::runner::Runner;
use std::sync::Arc;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Keeps the last `max` bytes of `text`, cut on a char boundary.
pub fn tail_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn failed_before_run(mut request: DownRequest, error: String) -> DownResult {
    request.end_epoch = epoch_now();
    DownResult {
        ok: false,
        return_code: -1,
        url: request.url.clone(),
        start_epoch: request.start_epoch,
        end_epoch: request.end_epoch,
        request,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(error),
        media_files: Vec::new(),
    }
}

/// Runs one dequeued request to completion and describes the outcome.
///
/// This function:
/// - Allocates the request id and job directory
/// - Renders the downloader command and stores it on the request
/// - Writes the audit file before the download starts
/// - Runs the downloader and classifies the job directory afterwards
pub async fn run_job(ctx: &ServerContext, runner: &dyn Runner, mut request: DownRequest) -> DownResult {
    let key = request.resource_key.clone();
    let (rid, dir) = ctx
        .begin_job(|rid| job_dir(ctx.output_root(), rid, &key))
        .await;
    request.rid = Some(rid);
    request.output_dir = dir.clone();
    request.start_epoch = epoch_now();

    let spec = match build_download_command(&request, &ctx.config.downloader) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::warn!(rid, key = %key, error = %e, "cannot build downloader command");
            return failed_before_run(request, e.to_string());
        }
    };
    request.command_template = spec.display();

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::error!(rid, dir = %dir.display(), error = %e, "cannot create job directory");
        return failed_before_run(request, format!("cannot create {}: {}", dir.display(), e));
    }
    if let Err(e) = write_audit_file(&request) {
        tracing::warn!(rid, key = %key, error = %e, "failed to write audit file");
    }

    tracing::info!(rid, key = %key, url = %request.url, resolution = request.resolution, "download started");

    let (return_code, stdout, stderr) = match runner.run(&spec).await {
        Ok(output) => (output.return_code, output.stdout, output.stderr),
        Err(e) => {
            tracing::warn!(rid, key = %key, error = %e, "downloader did not complete");
            (-1, String::new(), e.to_string())
        }
    };

    // Media may have landed even when the process failed or timed out.
    let rules = ctx.classify_rules.clone();
    let classify_dir = dir.clone();
    let Classification { ok, media_files } =
        tokio::task::spawn_blocking(move || classify_output_dir(&classify_dir, &rules))
            .await
            .unwrap_or_default();

    request.end_epoch = epoch_now();
    let cap = ctx.config.index.capture_bytes;
    let stdout = tail_bytes(&stdout, cap);
    let stderr = tail_bytes(&stderr, cap);
    let error = (!ok).then(|| compose_error_text(return_code, &stdout, &stderr));

    if ok {
        tracing::info!(rid, key = %key, return_code, files = media_files.len(), "download finished");
    } else {
        tracing::warn!(rid, key = %key, return_code, "download produced no media");
    }

    DownResult {
        ok,
        return_code,
        url: request.url.clone(),
        start_epoch: request.start_epoch,
        end_epoch: request.end_epoch,
        request,
        stdout,
        stderr,
        error,
        media_files,
    }
}

/// Dequeues and runs jobs until the cancellation token fires.
///
/// A job still running at shutdown is dropped, which kills its process.
pub async fn worker_loop(ctx: Arc<ServerContext>, runner: Arc<dyn Runner>) {
    let cancel = ctx.cancel_token().clone();
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = ctx.queue.dequeue() => request,
        };
        let key = request.resource_key.clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(key = %key, "download interrupted by shutdown");
                break;
            }
            result = run_job(&ctx, runner.as_ref(), request) => result,
        };
        ctx.record_result(result).await;

        if ctx.queue.is_empty().await {
            ctx.request_refill();
        }
    }
    tracing::debug!("worker stopped");
}

/// Runs whatever is queued right now, without waiting for more.
pub async fn drain_queue(ctx: &ServerContext, runner: &dyn Runner) -> usize {
    let mut done = 0;
    while !ctx.is_shutting_down() {
        let Some(request) = ctx.queue.try_dequeue().await else {
            break;
        };
        let result = run_job(ctx, runner, request).await;
        ctx.record_result(result).await;
        done += 1;
    }
    done
}

/// Keeps the worker alive, restarting it with exponential backoff if it panics.
pub async fn supervise_worker(ctx: Arc<ServerContext>, runner: Arc<dyn Runner>) {
    let cancel = ctx.cancel_token().clone();
    let max_backoff = Duration::from_secs(ctx.config.supervisor.restart_backoff_max_secs.max(1));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let started = Instant::now();
        let handle = tokio::spawn(worker_loop(ctx.clone(), runner.clone()));

        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                ContextStats::bump(&ctx.stats.worker_restarts, 1);
                ctx.abandon_running().await;
                if started.elapsed() > max_backoff {
                    backoff = INITIAL_BACKOFF;
                }
                tracing::error!(
                    backoff_secs = backoff.as_secs(),
                    "worker panicked, restarting"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker task ended unexpectedly");
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}
