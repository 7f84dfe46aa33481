//! Startup checks module for the fetch daemon
//!
//! Provides preflight checks to verify the environment before starting:
//! - Downloader availability (`<binary> --version`)
//! - Output and state directories exist or can be created
//! - Scan directories are reported when missing

use crate::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Downloader not available: {0}")]
    DownloaderUnavailable(String),

    #[error("Cannot prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No scan directories configured")]
    NoScanDirs,
}

/// Extracts the version from `--version` output (first non-empty line).
pub fn parse_downloader_version(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Check that the downloader runs `--version` successfully and return its version.
pub fn check_downloader_available(binary: &str) -> Result<String, StartupError> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .map_err(|e| {
            StartupError::DownloaderUnavailable(format!(
                "{} --version failed; is it installed and in PATH? Error: {}",
                binary, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::DownloaderUnavailable(format!(
            "{} --version exited with {}",
            binary, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_downloader_version(&stdout)
        .unwrap_or("unknown")
        .to_string())
}

fn ensure_dir(path: &Path) -> Result<(), StartupError> {
    fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates the output root and the index file's parent directory.
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    ensure_dir(&cfg.output_dir())?;
    if let Some(parent) = cfg.index_file().parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    Ok(())
}

/// Scan directories that do not exist yet; they are polled again on every rescan.
pub fn missing_scan_dirs(cfg: &Config) -> Vec<PathBuf> {
    cfg.paths
        .scan_dirs
        .iter()
        .filter(|dir| !dir.is_dir())
        .cloned()
        .collect()
}

/// Runs all startup checks.
///
/// Checks are run in the following order:
/// 1. At least one scan directory is configured
/// 2. Downloader availability
/// 3. Output and state directories
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    if cfg.paths.scan_dirs.is_empty() {
        return Err(StartupError::NoScanDirs);
    }

    let version = check_downloader_available(&cfg.downloader.binary)?;
    tracing::info!(binary = %cfg.downloader.binary, %version, "downloader available");

    prepare_directories(cfg)?;

    for dir in missing_scan_dirs(cfg) {
        tracing::warn!(dir = %dir.display(), "scan directory does not exist yet");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_downloader_version() {
        assert_eq!(parse_downloader_version("2024.08.06\n"), Some("2024.08.06"));
        assert_eq!(parse_downloader_version("\n  \n1.2.3\n"), Some("1.2.3"));
        assert_eq!(parse_downloader_version(""), None);
    }

    #[test]
    fn test_missing_downloader_is_rejected() {
        let err = check_downloader_available("/nonexistent/fetch-daemon-yt-dlp").unwrap_err();
        assert!(matches!(err, StartupError::DownloaderUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_downloader_is_rejected() {
        assert!(matches!(
            check_downloader_available("false"),
            Err(StartupError::DownloaderUnavailable(_))
        ));
    }

    #[test]
    fn test_prepare_directories() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.paths.work_dir = temp_dir.path().join("work");
        cfg.paths.index_file = Some(temp_dir.path().join("state").join("index.json"));

        prepare_directories(&cfg).unwrap();
        assert!(cfg.output_dir().is_dir());
        assert!(temp_dir.path().join("state").is_dir());
    }

    #[test]
    fn test_missing_scan_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.paths.scan_dirs = vec![
            temp_dir.path().to_path_buf(),
            temp_dir.path().join("absent"),
        ];
        assert_eq!(missing_scan_dirs(&cfg), vec![temp_dir.path().join("absent")]);
    }

    #[test]
    fn test_no_scan_dirs_fails_first() {
        let cfg = Config::default();
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::NoScanDirs)
        ));
    }
}
