//! Download request model.
//!
//! A [`DownRequest`] describes one download job from discovery until the
//! worker has stamped it with an id, an output directory and timing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

/// Errors raised while building a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("URL is empty")]
    EmptyUrl,

    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),
}

/// One download job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownRequest {
    /// Source URL as discovered.
    pub url: String,
    /// Canonical identifier used for deduplication.
    pub resource_key: String,
    /// Target video height.
    pub resolution: u32,
    /// Per-request proxy, overrides the global one.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Per-request rate limit in bytes per second.
    #[serde(default)]
    pub rate_limit: Option<u64>,
    /// Job output directory, assigned when the worker picks the request up.
    #[serde(default)]
    pub output_dir: PathBuf,
    /// Provenance tag, usually the input file name.
    pub source_label: String,
    /// Rendered downloader invocation.
    #[serde(default)]
    pub command_template: String,
    /// Request id, allocated at dequeue time.
    #[serde(default)]
    pub rid: Option<u64>,
    #[serde(default)]
    pub start_epoch: f64,
    #[serde(default)]
    pub end_epoch: f64,
}

impl DownRequest {
    /// Create a request for `url`, deriving its resource key.
    pub fn new(url: &str, resolution: u32, source_label: &str) -> Result<Self, RequestError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        let resource_key = resource_key_for(url)?;

        Ok(Self {
            url: url.to_string(),
            resource_key,
            resolution,
            proxy: None,
            rate_limit: None,
            output_dir: PathBuf::new(),
            source_label: source_label.to_string(),
            command_template: String::new(),
            rid: None,
            start_epoch: 0.0,
            end_epoch: 0.0,
        })
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u64) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Resource key reduced to characters safe inside a directory name.
    pub fn dir_safe_key(&self) -> String {
        sanitize_key(&self.resource_key)
    }
}

fn is_youtube_host(host: &str) -> bool {
    host == "youtube.com"
        || host.ends_with(".youtube.com")
        || host == "youtube-nocookie.com"
        || host.ends_with(".youtube-nocookie.com")
}

/// Derives the canonical resource key for a URL.
///
/// Video URLs resolve to the bare video id regardless of the URL shape
/// (`watch?v=`, `youtu.be/`, `/shorts/`, `/live/`, `/embed/`). Playlist URLs
/// without a video resolve to `list:<id>`. Anything else falls back to the
/// lowercased host plus path and query, without fragment or trailing slash.
pub fn resource_key_for(raw: &str) -> Result<String, RequestError> {
    let url = Url::parse(raw.trim()).map_err(|_| RequestError::InvalidUrl(raw.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| RequestError::InvalidUrl(raw.to_string()))?
        .trim_start_matches("www.")
        .trim_start_matches("m.")
        .to_string();

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    if host == "youtu.be" {
        if let Some(id) = segments.first() {
            return Ok((*id).to_string());
        }
    }

    if is_youtube_host(&host) {
        if let Some((_, v)) = url.query_pairs().find(|(k, v)| k == "v" && !v.is_empty()) {
            return Ok(v.into_owned());
        }
        if let [kind, id, ..] = segments.as_slice() {
            if matches!(*kind, "shorts" | "live" | "embed" | "v") {
                return Ok((*id).to_string());
            }
        }
        if let Some((_, list)) = url
            .query_pairs()
            .find(|(k, v)| k == "list" && !v.is_empty())
        {
            return Ok(format!("list:{}", list));
        }
    }

    let mut key = format!("{}/{}", host, segments.join("/"));
    while key.ends_with('/') {
        key.pop();
    }
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        key.push('?');
        key.push_str(query);
    }
    Ok(key)
}

/// Replaces anything outside `[A-Za-z0-9_-]` with `_`, capped at 64 chars.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

/// Current time as fractional seconds since the Unix epoch.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
