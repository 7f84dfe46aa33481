//! Scanner for batch request files in input directories.
//!
//! Each configured directory is listed non-recursively in sorted filename
//! order. Request files contribute URLs (any number per line); exclude files
//! contribute resource keys that must never be downloaded.

use crate::config::{Config, ConfigError};
use crate::request::{resource_key_for, DownRequest};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use walkdir::WalkDir;

/// Per-file scan failure. The file is skipped, the scan goes on.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is not valid UTF-8")]
    Encoding,

    #[error("Resolution {0} from file name is not supported")]
    UnsupportedResolution(u32),
}

/// Matching rules derived from configuration.
#[derive(Debug, Clone)]
pub struct ScanRules {
    pub exclude_pattern: Regex,
    /// Lowercase extensions of request files, without the dot.
    pub input_extensions: Vec<String>,
    pub supported_resolutions: Vec<u32>,
    pub default_resolution: u32,
}

impl ScanRules {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let exclude_pattern = Regex::new(&cfg.scan.exclude_pattern).map_err(|e| {
            ConfigError::Invalid(format!(
                "scan.exclude_pattern '{}': {}",
                cfg.scan.exclude_pattern, e
            ))
        })?;

        Ok(Self {
            exclude_pattern,
            input_extensions: cfg
                .scan
                .input_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            supported_resolutions: cfg.downloader.supported_resolutions.clone(),
            default_resolution: cfg.downloader.default_resolution,
        })
    }

    fn is_exclude_file(&self, name: &str) -> bool {
        self.exclude_pattern.is_match(name)
    }

    fn is_request_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.input_extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }
}

/// Everything one scan pass discovered.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Requests in discovery order, first occurrence of each key only.
    pub requests: Vec<DownRequest>,
    pub excluded_keys: BTreeSet<String>,
    pub errors: Vec<(PathBuf, ScanError)>,
    pub files_scanned: usize,
    /// Later occurrences of already-seen keys.
    pub duplicates_dropped: usize,
}

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("static regex is valid"))
}

fn resolution_regex() -> &'static Regex {
    static RES_RE: OnceLock<Regex> = OnceLock::new();
    RES_RE.get_or_init(|| Regex::new(r"^(\d{3,4})[pP]").expect("static regex is valid"))
}

/// Extracts bare URLs from a line, in order of appearance.
pub fn extract_urls(line: &str) -> Vec<&str> {
    url_regex()
        .find_iter(line)
        .map(|m| m.as_str().trim_end_matches([',', ';', ')', ']', '.']))
        .collect()
}

/// Reads the target height from a `<N>p` file name prefix (`1080p.txt`).
pub fn resolution_from_file_name(name: &str) -> Option<u32> {
    resolution_regex()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn read_text(path: &Path) -> Result<String, ScanError> {
    let bytes = fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| ScanError::Encoding)
}

/// Parses an exclude file: one resource key or URL per line, `#` comments.
pub fn parse_exclude_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            if line.starts_with("http://") || line.starts_with("https://") {
                resource_key_for(line).ok()
            } else {
                Some(line.to_string())
            }
        })
        .collect()
}

/// Parses a request file into requests, preserving URL order.
pub fn parse_request_file(
    content: &str,
    resolution: u32,
    source_label: &str,
) -> Vec<DownRequest> {
    content
        .lines()
        .flat_map(extract_urls)
        .filter_map(|url| match DownRequest::new(url, resolution, source_label) {
            Ok(req) => Some(req),
            Err(e) => {
                tracing::debug!(url, source = source_label, error = %e, "ignoring unparsable URL");
                None
            }
        })
        .collect()
}

/// Scans the given input directories for request and exclude files.
///
/// This function:
/// - Lists each directory non-recursively, sorted by file name
/// - Skips hidden files and anything that is not a regular file
/// - Collects exclude keys from files matching the exclude pattern
/// - Builds requests from request files, first occurrence of a key winning
/// - Records per-file errors without aborting the scan
/// - Never modifies input files
pub fn scan_input_dirs(dirs: &[PathBuf], rules: &ScanRules) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "scan directory missing, skipping");
            continue;
        }

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            let path = entry.path();

            if rules.is_exclude_file(&name) {
                outcome.files_scanned += 1;
                match read_text(path) {
                    Ok(content) => outcome.excluded_keys.extend(parse_exclude_file(&content)),
                    Err(e) => outcome.errors.push((path.to_path_buf(), e)),
                }
                continue;
            }

            if !rules.is_request_file(path) {
                continue;
            }
            outcome.files_scanned += 1;

            let resolution =
                resolution_from_file_name(&name).unwrap_or(rules.default_resolution);
            if !rules.supported_resolutions.contains(&resolution) {
                outcome
                    .errors
                    .push((path.to_path_buf(), ScanError::UnsupportedResolution(resolution)));
                continue;
            }

            let content = match read_text(path) {
                Ok(content) => content,
                Err(e) => {
                    outcome.errors.push((path.to_path_buf(), e));
                    continue;
                }
            };

            for request in parse_request_file(&content, resolution, &name) {
                if seen.insert(request.resource_key.clone()) {
                    outcome.requests.push(request);
                } else {
                    outcome.duplicates_dropped += 1;
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn rules() -> ScanRules {
        ScanRules::from_config(&Config::default()).unwrap()
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_resolution_from_file_name() {
        assert_eq!(resolution_from_file_name("1080p.txt"), Some(1080));
        assert_eq!(resolution_from_file_name("480P_music.txt"), Some(480));
        assert_eq!(resolution_from_file_name("2160p-archive.txt"), Some(2160));
        assert_eq!(resolution_from_file_name("list.txt"), None);
        assert_eq!(resolution_from_file_name("p1080.txt"), None);
    }

    #[test]
    fn test_extract_urls_multiple_per_line() {
        let line = "see https://youtu.be/abc123, and (https://www.youtube.com/watch?v=def456).";
        assert_eq!(
            extract_urls(line),
            vec!["https://youtu.be/abc123", "https://www.youtube.com/watch?v=def456"]
        );
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn test_concrete_1080p_scenario() {
        let temp_dir = TempDir::new().unwrap();
        write(
            temp_dir.path(),
            "1080p.txt",
            "https://www.youtube.com/watch?v=abc123\nhttps://www.youtube.com/watch?v=def456\n",
        );

        let outcome = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.requests.len(), 2);
        assert_eq!(outcome.requests[0].resource_key, "abc123");
        assert_eq!(outcome.requests[1].resource_key, "def456");
        for req in &outcome.requests {
            assert_eq!(req.resolution, 1080);
            assert_eq!(req.source_label, "1080p.txt");
        }
    }

    #[test]
    fn test_first_file_in_sorted_order_wins() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "b_720p.txt", "https://youtu.be/shared\n");
        write(temp_dir.path(), "1080p.txt", "https://youtu.be/shared https://youtu.be/own\n");

        let outcome = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());

        assert_eq!(outcome.requests.len(), 2);
        assert_eq!(outcome.requests[0].resource_key, "shared");
        assert_eq!(outcome.requests[0].source_label, "1080p.txt");
        assert_eq!(outcome.duplicates_dropped, 1);
    }

    #[test]
    fn test_exclude_files_collected() {
        let temp_dir = TempDir::new().unwrap();
        write(
            temp_dir.path(),
            "exclude_music.txt",
            "# never again\nabc123\n\nhttps://youtu.be/def456\n",
        );
        write(temp_dir.path(), "720p.txt", "https://youtu.be/ghi789\n");

        let outcome = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());

        assert_eq!(
            outcome.excluded_keys.iter().cloned().collect::<Vec<_>>(),
            vec!["abc123".to_string(), "def456".to_string()]
        );
        // Exclude lists never turn into requests themselves.
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.files_scanned, 2);
    }

    #[test]
    fn test_bad_files_are_skipped_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), [0xff, 0xfe, 0x00]).unwrap();
        write(temp_dir.path(), "999p.txt", "https://youtu.be/abc123\n");
        write(temp_dir.path(), "z.txt", "https://youtu.be/def456\n");

        let outcome = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());

        assert_eq!(outcome.errors.len(), 2);
        // Sorted order: "999p.txt" < "a.txt" < "z.txt".
        assert!(matches!(outcome.errors[0].1, ScanError::UnsupportedResolution(999)));
        assert!(matches!(outcome.errors[1].1, ScanError::Encoding));
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].resolution, 720);
    }

    #[test]
    fn test_non_recursive_hidden_and_foreign_files_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        write(&nested, "720p.txt", "https://youtu.be/deep\n");
        write(temp_dir.path(), ".hidden.txt", "https://youtu.be/hidden\n");
        write(temp_dir.path(), "notes.md", "https://youtu.be/markdown\n");

        let outcome = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());
        assert!(outcome.requests.is_empty());
        assert_eq!(outcome.files_scanned, 0);
    }

    #[test]
    fn test_scan_does_not_modify_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let content = "https://youtu.be/abc123\n";
        write(temp_dir.path(), "720p.txt", content);

        let _ = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());
        let _ = scan_input_dirs(&[temp_dir.path().to_path_buf()], &rules());

        assert_eq!(
            fs::read_to_string(temp_dir.path().join("720p.txt")).unwrap(),
            content
        );
    }

    #[test]
    fn test_invalid_exclude_pattern_is_config_error() {
        let mut cfg = Config::default();
        cfg.scan.exclude_pattern = "([".to_string();
        assert!(matches!(
            ScanRules::from_config(&cfg),
            Err(ConfigError::Invalid(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        // Scans are deterministic given unchanged directory contents.
        #[test]
        fn prop_scan_is_deterministic(
            files in proptest::collection::btree_map(
                "[a-z]{1,8}",
                proptest::collection::vec("[A-Za-z0-9]{6,11}", 0..5),
                0..5,
            ),
        ) {
            let temp_dir = TempDir::new().unwrap();
            for (name, ids) in &files {
                let body: String = ids
                    .iter()
                    .map(|id| format!("https://youtu.be/{}\n", id))
                    .collect();
                write(temp_dir.path(), &format!("{}.txt", name), &body);
            }

            let dirs = [temp_dir.path().to_path_buf()];
            let first = scan_input_dirs(&dirs, &rules());
            let second = scan_input_dirs(&dirs, &rules());

            let keys = |o: &ScanOutcome| {
                o.requests.iter().map(|r| r.resource_key.clone()).collect::<Vec<_>>()
            };
            prop_assert_eq!(keys(&first), keys(&second));

            let unique: HashSet<_> = keys(&first).into_iter().collect();
            prop_assert_eq!(unique.len(), first.requests.len());
        }
    }
}
