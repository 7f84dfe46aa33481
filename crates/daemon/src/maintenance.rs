//! Output directory housekeeping.
//!
//! Job directories are reclaimed oldest id first whenever the output root
//! exceeds its byte budget or the filesystem drops below its free-space
//! floor. The directory of the running job is never touched.

use crate::index::{parse_id_prefix, IndexCounts};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Limits that trigger reclamation; zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimLimits {
    pub max_output_bytes: u64,
    pub min_free_bytes: u64,
}

impl ReclaimLimits {
    pub fn is_disabled(&self) -> bool {
        self.max_output_bytes == 0 && self.min_free_bytes == 0
    }
}

/// What one reclamation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Output root size before the pass.
    pub total_bytes: u64,
    pub freed_bytes: u64,
    pub removed: Vec<PathBuf>,
}

/// A job directory and its on-disk footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirUsage {
    pub id: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Total size of regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Job directories in the output root, oldest id first.
pub fn job_dirs_by_age(output_root: &Path) -> io::Result<Vec<JobDirUsage>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(output_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(id) = entry.file_name().to_str().and_then(parse_id_prefix) else {
            continue;
        };
        let path = entry.path();
        dirs.push(JobDirUsage {
            id,
            bytes: dir_size(&path),
            path,
        });
    }
    dirs.sort_by_key(|d| d.id);
    Ok(dirs)
}

/// Free bytes on the filesystem holding `path`, if it can be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    use sysinfo::Disks;

    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Bytes that must go for the output root to satisfy `limits`.
fn bytes_to_free(total: u64, available: Option<u64>, limits: &ReclaimLimits) -> u64 {
    let over_budget = if limits.max_output_bytes > 0 {
        total.saturating_sub(limits.max_output_bytes)
    } else {
        0
    };
    let under_floor = match available {
        Some(free) if limits.min_free_bytes > 0 => limits.min_free_bytes.saturating_sub(free),
        _ => 0,
    };
    over_budget.max(under_floor)
}

/// Deletes the oldest job directories until `limits` hold again.
pub fn reclaim_space(
    output_root: &Path,
    limits: &ReclaimLimits,
    protected: &HashSet<PathBuf>,
) -> io::Result<ReclaimReport> {
    if limits.is_disabled() || !output_root.is_dir() {
        return Ok(ReclaimReport::default());
    }

    let dirs = job_dirs_by_age(output_root)?;
    let total: u64 = dirs.iter().map(|d| d.bytes).sum();
    let available = if limits.min_free_bytes > 0 {
        available_space(output_root)
    } else {
        None
    };

    let mut report = ReclaimReport {
        total_bytes: total,
        ..Default::default()
    };
    let needed = bytes_to_free(total, available, limits);
    if needed == 0 {
        return Ok(report);
    }

    for dir in dirs {
        if report.freed_bytes >= needed {
            break;
        }
        if protected.contains(&dir.path) {
            continue;
        }
        match fs::remove_dir_all(&dir.path) {
            Ok(()) => {
                tracing::info!(
                    dir = %dir.path.display(),
                    bytes = dir.bytes,
                    "reclaimed job directory"
                );
                report.freed_bytes += dir.bytes;
                report.removed.push(dir.path);
            }
            Err(e) => {
                tracing::warn!(dir = %dir.path.display(), error = %e, "failed to reclaim job directory");
            }
        }
    }

    Ok(report)
}

/// Emits the periodic success/failure summary.
pub fn log_summary(counts: &IndexCounts, period_secs: u64) {
    tracing::info!(
        period_secs,
        total = counts.total,
        ok = counts.ok,
        failed = counts.failed,
        "download summary"
    );
}
