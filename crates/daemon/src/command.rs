//! Downloader command builder.
//!
//! Renders a [`DownRequest`] plus the global downloader settings into the
//! argument vector of one downloader invocation. Building is pure: nothing is
//! spawned and nothing touches the filesystem.

use crate::config::{ConfigError, DownloaderConfig};
use crate::request::DownRequest;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use url::Url;

/// A fully resolved process invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Shell-quoted command line, for audit files and logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build a tokio command with stdin closed and output captured.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Rate limit for a request: explicit value, else the first matching
/// resolution tier, else the global limit. Never below the configured floor.
pub fn effective_rate_limit(request: &DownRequest, settings: &DownloaderConfig) -> u64 {
    let rate = request.rate_limit.unwrap_or_else(|| {
        settings
            .rate_tiers
            .iter()
            .find(|tier| request.resolution <= tier.max_height)
            .map(|tier| tier.rate_limit)
            .unwrap_or(settings.rate_limit)
    });
    rate.max(settings.rate_limit_floor)
}

/// Number of playlist items to fetch, read from the URL query and clamped
/// into `[playlist_min_items, playlist_max_items]`.
pub fn playlist_item_bound(url: &str, settings: &DownloaderConfig) -> u32 {
    let requested = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == settings.playlist_items_param.as_str())
                .and_then(|(_, v)| v.trim().parse::<u32>().ok())
        })
        .unwrap_or(settings.playlist_default_items);

    requested.clamp(settings.playlist_min_items, settings.playlist_max_items)
}

/// True for short-form video URLs (`/shorts/<id>`).
pub fn is_short_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next().map(|s| s == "shorts"))
        })
        .unwrap_or(false)
}

/// Output filename template: truncated title, media id and short marker.
pub fn output_template(url: &str, settings: &DownloaderConfig) -> String {
    let marker = if is_short_url(url) { ".short" } else { "" };
    format!(
        "%(title).{}B [%(id)s]{}.%(ext)s",
        settings.title_max_bytes, marker
    )
}

/// Build the downloader invocation for `request`.
///
/// # Errors
/// - `ConfigError::Invalid` when the URL or output directory is missing
/// - `ConfigError::UnsupportedResolution` for heights outside the supported list
/// - `ConfigError::ProxyRequired` when policy demands a proxy and none is set
pub fn build_download_command(
    request: &DownRequest,
    settings: &DownloaderConfig,
) -> Result<CommandSpec, ConfigError> {
    if request.url.trim().is_empty() {
        return Err(ConfigError::Invalid("request has no URL".into()));
    }
    if !settings.supported_resolutions.contains(&request.resolution) {
        return Err(ConfigError::UnsupportedResolution(request.resolution));
    }
    if request.output_dir.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "request {} has no output directory",
            request.resource_key
        )));
    }

    let proxy = request
        .proxy
        .as_deref()
        .or(settings.proxy.as_deref())
        .unwrap_or("");
    if settings.require_proxy && proxy.is_empty() {
        return Err(ConfigError::ProxyRequired);
    }

    let rate = effective_rate_limit(request, settings);
    let items = playlist_item_bound(&request.url, settings);

    let mut args: Vec<String> = Vec::with_capacity(40);
    let mut flag = |name: &str, value: String| {
        args.push(name.to_string());
        args.push(value);
    };

    flag("--socket-timeout", settings.timeout_secs.to_string());
    flag("--limit-rate", rate.to_string());
    // Empty proxy string forces a direct connection.
    flag("--proxy", proxy.to_string());
    flag("--retries", settings.retries.to_string());
    flag("--fragment-retries", settings.retries.to_string());
    flag("--max-filesize", settings.max_filesize.clone());
    flag("-S", format!("res:{}", request.resolution));
    if let Some(format) = settings.format.as_deref().filter(|f| !f.is_empty()) {
        flag("-f", format.to_string());
    }
    flag("-P", request.output_dir.to_string_lossy().into_owned());
    flag("-o", output_template(&request.url, settings));
    flag("--playlist-items", format!("1:{}", items));

    args.push("--write-info-json".to_string());
    args.push("--write-thumbnail".to_string());
    args.push("--no-progress".to_string());
    args.push("--newline".to_string());
    args.push("--".to_string());
    args.push(request.url.clone());

    Ok(CommandSpec {
        program: settings.binary.clone(),
        args,
    })
}
