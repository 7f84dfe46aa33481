//! Persistent history of finished downloads and the request id counter.
//!
//! Results are kept in completion order in a capped ring and written as a
//! single JSON document `{ "rid": .., "results": [..] }`. Saves go through a
//! temp file and a rename so a crash never leaves a half-written index.

use crate::config::IndexConfig;
use crate::request::DownRequest;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors reading or writing the index file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed index {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of one download job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownResult {
    pub ok: bool,
    /// Exit code, -1 when the process never ran or was killed.
    pub return_code: i32,
    pub url: String,
    pub request: DownRequest,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub media_files: Vec<String>,
    pub start_epoch: f64,
    pub end_epoch: f64,
}

impl DownResult {
    pub fn resource_key(&self) -> &str {
        &self.request.resource_key
    }

    pub fn rid(&self) -> Option<u64> {
        self.request.rid
    }
}

/// On-disk layout of the index file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub rid: u64,
    #[serde(default)]
    pub results: Vec<DownResult>,
}

/// Limits applied to the in-memory history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSettings {
    pub max_results: usize,
    pub id_floor: u64,
}

impl From<&IndexConfig> for IndexSettings {
    fn from(cfg: &IndexConfig) -> Self {
        Self {
            max_results: cfg.max_results.max(1),
            id_floor: cfg.id_floor.max(1),
        }
    }
}

/// Success and failure tallies over a slice of history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexCounts {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
}

/// In-memory history plus the next usable request id.
#[derive(Debug)]
pub struct StateIndex {
    path: PathBuf,
    settings: IndexSettings,
    results: VecDeque<DownResult>,
    rid: u64,
    dirty: bool,
}

impl StateIndex {
    /// Empty index that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>, settings: IndexSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            results: VecDeque::new(),
            rid: settings.id_floor.max(1),
            dirty: false,
        }
    }

    /// Loads the index from disk and recovers the id counter.
    ///
    /// A missing file starts an empty history. An unreadable or corrupt file
    /// is logged and also yields an empty history; ids stay monotonic because
    /// the output directory is consulted either way.
    pub fn load(path: impl Into<PathBuf>, output_root: &Path, settings: IndexSettings) -> Self {
        let path = path.into();
        let persisted = match read_persisted(&path) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => PersistedIndex::default(),
            Err(e) => {
                tracing::warn!(error = %e, "index unusable, starting with empty history");
                PersistedIndex::default()
            }
        };

        let rid = recover_next_id(&persisted, settings.id_floor, max_id_in_output_dir(output_root));

        let mut results: VecDeque<DownResult> = persisted.results.into();
        while results.len() > settings.max_results {
            results.pop_front();
        }

        tracing::info!(
            index = %path.display(),
            results = results.len(),
            next_rid = rid,
            "state index loaded"
        );

        Self {
            path,
            settings,
            results,
            rid,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next id that `allocate_rid` will hand out.
    pub fn next_rid(&self) -> u64 {
        self.rid
    }

    /// Hands out a fresh request id.
    pub fn allocate_rid(&mut self) -> u64 {
        let rid = self.rid;
        self.rid += 1;
        self.dirty = true;
        rid
    }

    /// Records a finished job, evicting the oldest result when over capacity.
    pub fn append(&mut self, result: DownResult) -> Option<DownResult> {
        if let Some(rid) = result.rid() {
            self.rid = self.rid.max(rid + 1);
        }
        self.results.push_back(result);
        self.dirty = true;
        if self.results.len() > self.settings.max_results {
            self.results.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Results in completion order, oldest first.
    pub fn results(&self) -> impl Iterator<Item = &DownResult> {
        self.results.iter()
    }

    /// Most recent result for a resource key.
    pub fn last_completed(&self, key: &str) -> Option<&DownResult> {
        self.results.iter().rev().find(|r| r.resource_key() == key)
    }

    /// Whether a recent result for `key` means it should not be fetched again.
    ///
    /// Successes block for `ok_window`, failures for `failed_window`.
    pub fn blocks_retry(
        &self,
        key: &str,
        now_epoch: f64,
        ok_window: Duration,
        failed_window: Duration,
    ) -> bool {
        match self.last_completed(key) {
            Some(last) => {
                let window = if last.ok { ok_window } else { failed_window };
                now_epoch - last.end_epoch < window.as_secs_f64()
            }
            None => false,
        }
    }

    pub fn counts(&self) -> IndexCounts {
        tally(self.results.iter())
    }

    /// Tallies results that finished at or after `since_epoch`.
    pub fn counts_since(&self, since_epoch: f64) -> IndexCounts {
        tally(self.results.iter().filter(|r| r.end_epoch >= since_epoch))
    }

    /// Resource keys referenced by the last `n` results.
    pub fn recent_keys(&self, n: usize) -> Vec<String> {
        self.results
            .iter()
            .rev()
            .take(n)
            .map(|r| r.resource_key().to_string())
            .collect()
    }

    /// Writes the index atomically and clears the dirty flag.
    pub fn save(&mut self) -> Result<(), PersistenceError> {
        let persisted = PersistedIndexRef {
            rid: self.rid,
            results: &self.results,
        };
        let json = serde_json::to_vec_pretty(&persisted).map_err(|source| {
            PersistenceError::Json {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, &json).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}

#[derive(Serialize)]
struct PersistedIndexRef<'a> {
    rid: u64,
    results: &'a VecDeque<DownResult>,
}

fn tally<'a>(results: impl Iterator<Item = &'a DownResult>) -> IndexCounts {
    results.fold(IndexCounts::default(), |mut acc, r| {
        acc.total += 1;
        if r.ok {
            acc.ok += 1;
        } else {
            acc.failed += 1;
        }
        acc
    })
}

fn read_persisted(path: &Path) -> Result<Option<PersistedIndex>, PersistenceError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| PersistenceError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes `data` to `<path>.tmp`, syncs it, then renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    sync_parent_dir(path)
}

/// Flushes the directory entry of `path` so a completed rename is durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Parses the numeric id prefix of a job directory name (`000042_abc`).
pub fn parse_id_prefix(name: &str) -> Option<u64> {
    let digits: &str = &name[..name.bytes().take_while(u8::is_ascii_digit).count()];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Largest id encoded in the names of the output root's entries.
pub fn max_id_in_output_dir(output_root: &Path) -> Option<u64> {
    let entries = fs::read_dir(output_root).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(parse_id_prefix))
        .max()
}

/// Next id that cannot collide with any id already handed out.
pub fn recover_next_id(persisted: &PersistedIndex, id_floor: u64, max_dir_id: Option<u64>) -> u64 {
    let from_results = persisted
        .results
        .iter()
        .filter_map(DownResult::rid)
        .max()
        .map(|rid| rid + 1);

    [
        Some(id_floor.max(1)),
        Some(persisted.rid),
        from_results,
        max_dir_id.map(|id| id + 1),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn settings(max_results: usize) -> IndexSettings {
        IndexSettings {
            max_results,
            id_floor: 1,
        }
    }

    fn result(id: &str, rid: u64, ok: bool, end_epoch: f64) -> DownResult {
        let mut request =
            DownRequest::new(&format!("https://youtu.be/{}", id), 720, "720p.txt").unwrap();
        request.rid = Some(rid);
        DownResult {
            ok,
            return_code: if ok { 0 } else { 1 },
            url: request.url.clone(),
            request,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            media_files: Vec::new(),
            start_epoch: end_epoch - 1.0,
            end_epoch,
        }
    }

    #[test]
    fn test_parse_id_prefix() {
        assert_eq!(parse_id_prefix("000042_abc123"), Some(42));
        assert_eq!(parse_id_prefix("7"), Some(7));
        assert_eq!(parse_id_prefix("index.json"), None);
        assert_eq!(parse_id_prefix("_000042"), None);
    }

    #[test]
    fn test_id_recovery_after_index_loss() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("out");
        fs::create_dir_all(out.join("000007_a")).unwrap();
        fs::create_dir_all(out.join("000042_b")).unwrap();
        fs::create_dir_all(out.join("notes")).unwrap();

        let mut index = StateIndex::load(temp_dir.path().join("index.json"), &out, settings(10));
        assert!(index.is_empty());
        assert!(index.allocate_rid() >= 43);
    }

    #[test]
    fn test_corrupt_index_degrades_to_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        fs::write(&path, b"{ not json").unwrap();
        let out = temp_dir.path().join("out");
        fs::create_dir_all(out.join("000003_x")).unwrap();

        let index = StateIndex::load(&path, &out, settings(10));
        assert!(index.is_empty());
        assert_eq!(index.next_rid(), 4);
    }

    #[test]
    fn test_recover_next_id_takes_max_of_all_sources() {
        let persisted = PersistedIndex {
            rid: 10,
            results: vec![result("a", 15, true, 100.0)],
        };
        assert_eq!(recover_next_id(&persisted, 1, None), 16);
        assert_eq!(recover_next_id(&persisted, 100, None), 100);
        assert_eq!(recover_next_id(&persisted, 1, Some(30)), 31);
        assert_eq!(recover_next_id(&PersistedIndex::default(), 1, None), 1);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("index.json");
        let out = temp_dir.path().join("out");

        let mut index = StateIndex::new(&path, settings(10));
        let rid = index.allocate_rid();
        index.append(result("abc123", rid, true, 1000.0));
        assert!(index.is_dirty());
        index.save().unwrap();
        assert!(!index.is_dirty());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = StateIndex::load(&path, &out, settings(10));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.next_rid(), rid + 1);
        assert_eq!(reloaded.last_completed("abc123").unwrap().request.rid, Some(rid));
    }

    #[test]
    fn test_write_atomic_replaces_and_syncs_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("index.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_dir.path().join("nested").join("index.json.tmp").exists());
        sync_parent_dir(&path).unwrap();
    }

    #[test]
    fn test_blocks_retry_windows() {
        let mut index = StateIndex::new("/tmp/unused.json", settings(10));
        index.append(result("good", 1, true, 1000.0));
        index.append(result("bad", 2, false, 1000.0));

        let ok_window = Duration::from_secs(30 * 86400);
        let failed_window = Duration::from_secs(3600);

        assert!(index.blocks_retry("good", 1000.0 + 7200.0, ok_window, failed_window));
        assert!(index.blocks_retry("bad", 1000.0 + 60.0, ok_window, failed_window));
        assert!(!index.blocks_retry("bad", 1000.0 + 7200.0, ok_window, failed_window));
        assert!(!index.blocks_retry("unknown", 1000.0, ok_window, failed_window));
    }

    #[test]
    fn test_last_completed_prefers_newest() {
        let mut index = StateIndex::new("/tmp/unused.json", settings(10));
        index.append(result("k", 1, false, 10.0));
        index.append(result("k", 2, true, 20.0));
        assert!(index.last_completed("k").unwrap().ok);
    }

    #[test]
    fn test_counts_since() {
        let mut index = StateIndex::new("/tmp/unused.json", settings(10));
        index.append(result("a", 1, true, 10.0));
        index.append(result("b", 2, false, 20.0));
        index.append(result("c", 3, true, 30.0));

        assert_eq!(
            index.counts(),
            IndexCounts {
                total: 3,
                ok: 2,
                failed: 1
            }
        );
        assert_eq!(index.counts_since(20.0).total, 2);
        assert_eq!(index.counts_since(20.0).ok, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        // The ring keeps the newest `cap` results in completion order.
        #[test]
        fn prop_ring_eviction(cap in 1usize..10, n in 0usize..30) {
            let mut index = StateIndex::new("/tmp/unused.json", settings(cap));
            let mut evicted = Vec::new();
            for i in 0..n {
                let rid = index.allocate_rid();
                if let Some(old) = index.append(result(&format!("k{}", i), rid, i % 2 == 0, i as f64)) {
                    evicted.push(old.rid().unwrap());
                }
            }

            prop_assert_eq!(index.len(), n.min(cap));
            prop_assert_eq!(evicted.len(), n.saturating_sub(cap));
            let kept: Vec<u64> = index.results().filter_map(DownResult::rid).collect();
            let expected: Vec<u64> = ((n.saturating_sub(cap) as u64 + 1)..=(n as u64)).collect();
            prop_assert_eq!(kept, expected);
        }

        #[test]
        fn prop_recovered_id_exceeds_every_known_id(
            persisted_rid in 0u64..1000,
            result_rids in proptest::collection::vec(1u64..1000, 0..5),
            dir_id in proptest::option::of(0u64..1000),
            floor in 1u64..50,
        ) {
            let persisted = PersistedIndex {
                rid: persisted_rid,
                results: result_rids.iter().map(|&r| result("x", r, true, 0.0)).collect(),
            };
            let next = recover_next_id(&persisted, floor, dir_id);
            prop_assert!(next >= floor);
            prop_assert!(next >= persisted_rid);
            for r in &result_rids {
                prop_assert!(next > *r);
            }
            if let Some(d) = dir_id {
                prop_assert!(next > d);
            }
        }
    }
}
