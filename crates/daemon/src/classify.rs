//! Result classifier for finished download jobs.
//!
//! The downloader's exit code is unreliable for partial playlist downloads,
//! so a job counts as successful only when its output directory holds at
//! least one media file of a recognized extension and a plausible size.

use crate::config::ClassifyConfig;
use std::fs;
use std::path::Path;

/// Thresholds applied to an output directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyRules {
    /// Smallest file size that counts as real media.
    pub min_media_bytes: u64,
    /// Lowercase extensions without the leading dot.
    pub media_extensions: Vec<String>,
}

impl From<&ClassifyConfig> for ClassifyRules {
    fn from(cfg: &ClassifyConfig) -> Self {
        Self {
            min_media_bytes: cfg.min_media_bytes,
            media_extensions: cfg
                .media_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }
}

/// Outcome of inspecting one output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub ok: bool,
    /// File names that satisfied both the extension and the size rule, sorted.
    pub media_files: Vec<String>,
}

/// Checks if a file has a recognized media extension (case-insensitive).
pub fn is_media_file(path: &Path, rules: &ClassifyRules) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            rules.media_extensions.iter().any(|m| *m == ext_lower)
        })
        .unwrap_or(false)
}

/// Classifies a job by listing its output directory (non-recursive).
///
/// Files that disappear or cannot be stat'ed mid-listing are ignored, as is
/// a missing directory, which simply yields `ok == false`.
pub fn classify_output_dir(dir: &Path, rules: &ClassifyRules) -> Classification {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Classification::default(),
    };

    let mut media_files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|entry| is_media_file(&entry.path(), rules))
        .filter(|entry| {
            entry
                .metadata()
                .map(|m| m.is_file() && m.len() >= rules.min_media_bytes)
                .unwrap_or(false)
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    media_files.sort();

    Classification {
        ok: !media_files.is_empty(),
        media_files,
    }
}

/// Diagnostic text stored with failed results.
pub fn compose_error_text(return_code: i32, stdout: &str, stderr: &str) -> String {
    format!(
        "return code: {}\n--- stdout ---\n{}\n--- stderr ---\n{}",
        return_code,
        stdout.trim_end(),
        stderr.trim_end()
    )
}
