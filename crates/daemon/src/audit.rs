//! Job directory naming and the per-job request audit file.
//!
//! Every job gets `<output_root>/<rid:06>_<key>` and, inside it, a pretty
//! JSON copy of the resolved request named `<rid:06>.request.json`.

use crate::request::{sanitize_key, DownRequest};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Output directory for job `rid` fetching `resource_key`.
///
/// For example: `(/out, 42, "abc123")` -> `/out/000042_abc123`
pub fn job_dir(output_root: &Path, rid: u64, resource_key: &str) -> PathBuf {
    output_root.join(format!("{:06}_{}", rid, sanitize_key(resource_key)))
}

/// Audit file path inside a job directory.
pub fn audit_file_path(job_dir: &Path, rid: u64) -> PathBuf {
    job_dir.join(format!("{:06}.request.json", rid))
}

/// Writes the resolved request next to its downloads.
///
/// The request must already carry its `rid` and `output_dir`.
pub fn write_audit_file(request: &DownRequest) -> io::Result<PathBuf> {
    let rid = request
        .rid
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request has no id"))?;
    let path = audit_file_path(&request.output_dir, rid);

    let json = serde_json::to_string_pretty(request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = File::create(&path)?;
    writeln!(file, "{}", json)?;
    Ok(path)
}
