//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is present but not usable
    Invalid(String),
    /// Requested resolution is not in the supported list
    UnsupportedResolution(u32),
    /// Policy requires a proxy but none was supplied
    ProxyRequired,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::UnsupportedResolution(res) => {
                write!(f, "Unsupported resolution: {}", res)
            }
            ConfigError::ProxyRequired => {
                write!(f, "A proxy is required by policy but none was configured")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root of all daemon state
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directories scanned for batch request files
    #[serde(default)]
    pub scan_dirs: Vec<PathBuf>,
    /// Where per-job output directories are created (defaults to `<work_dir>/out`)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Persisted result index (defaults to `<work_dir>/index.json`)
    #[serde(default)]
    pub index_file: Option<PathBuf>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/fetch-daemon")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            scan_dirs: Vec::new(),
            output_dir: None,
            index_file: None,
        }
    }
}

/// Rate limit applied to requests up to a given video height
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateTier {
    pub max_height: u32,
    pub rate_limit: u64,
}

/// External downloader invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloaderConfig {
    /// Downloader executable (looked up in PATH when not absolute)
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Socket timeout passed to the downloader, seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry count passed to the downloader
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Global rate limit in bytes per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,
    /// Lowest rate limit ever passed to the downloader
    #[serde(default = "default_rate_limit_floor")]
    pub rate_limit_floor: u64,
    /// Per-resolution rate limits, first matching tier wins
    #[serde(default)]
    pub rate_tiers: Vec<RateTier>,
    /// SOCKS/HTTP proxy, `None` means direct connection
    #[serde(default)]
    pub proxy: Option<String>,
    /// Refuse to build commands without a proxy
    #[serde(default)]
    pub require_proxy: bool,
    /// Max file size guard, downloader syntax (e.g. "4G")
    #[serde(default = "default_max_filesize")]
    pub max_filesize: String,
    /// Optional format selection expression (`-f`)
    #[serde(default)]
    pub format: Option<String>,
    /// Byte budget for the title in output filenames
    #[serde(default = "default_title_max_bytes")]
    pub title_max_bytes: u32,
    #[serde(default = "default_supported_resolutions")]
    pub supported_resolutions: Vec<u32>,
    /// Resolution used when an input file name carries none
    #[serde(default = "default_resolution")]
    pub default_resolution: u32,
    /// URL query parameter holding the playlist item count
    #[serde(default = "default_playlist_items_param")]
    pub playlist_items_param: String,
    #[serde(default = "default_playlist_min_items")]
    pub playlist_min_items: u32,
    #[serde(default = "default_playlist_max_items")]
    pub playlist_max_items: u32,
    #[serde(default = "default_playlist_default_items")]
    pub playlist_default_items: u32,
}

fn default_binary() -> String {
    "yt-dlp".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retries() -> u32 {
    10
}

fn default_rate_limit() -> u64 {
    2_000_000
}

fn default_rate_limit_floor() -> u64 {
    1000
}

fn default_max_filesize() -> String {
    "4G".to_string()
}

fn default_title_max_bytes() -> u32 {
    80
}

fn default_supported_resolutions() -> Vec<u32> {
    vec![144, 240, 360, 480, 720, 1080, 1440, 2160]
}

fn default_resolution() -> u32 {
    720
}

fn default_playlist_items_param() -> String {
    "n".to_string()
}

fn default_playlist_min_items() -> u32 {
    2
}

fn default_playlist_max_items() -> u32 {
    500
}

fn default_playlist_default_items() -> u32 {
    10
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            rate_limit: default_rate_limit(),
            rate_limit_floor: default_rate_limit_floor(),
            rate_tiers: Vec::new(),
            proxy: None,
            require_proxy: false,
            max_filesize: default_max_filesize(),
            format: None,
            title_max_bytes: default_title_max_bytes(),
            supported_resolutions: default_supported_resolutions(),
            default_resolution: default_resolution(),
            playlist_items_param: default_playlist_items_param(),
            playlist_min_items: default_playlist_min_items(),
            playlist_max_items: default_playlist_max_items(),
            playlist_default_items: default_playlist_default_items(),
        }
    }
}

/// Pending queue and dedup policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of pending (not yet running) requests
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Successful downloads of the same key inside this window are skipped
    #[serde(default = "default_recency_window_days")]
    pub recency_window_days: u64,
    /// Failed downloads are retried only after this many seconds
    #[serde(default = "default_retry_failed_after_secs")]
    pub retry_failed_after_secs: u64,
}

fn default_max_pending() -> usize {
    3
}

fn default_recency_window_days() -> u64 {
    30
}

fn default_retry_failed_after_secs() -> u64 {
    86_400
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            recency_window_days: default_recency_window_days(),
            retry_failed_after_secs: default_retry_failed_after_secs(),
        }
    }
}

/// Result history settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    /// Ring capacity of the result history
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Bytes of stdout/stderr kept per result
    #[serde(default = "default_capture_bytes")]
    pub capture_bytes: usize,
    /// Request ids never go below this value
    #[serde(default = "default_id_floor")]
    pub id_floor: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_max_results() -> usize {
    500
}

fn default_capture_bytes() -> usize {
    4096
}

fn default_id_floor() -> u64 {
    1
}

fn default_flush_interval_secs() -> u64 {
    60
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            capture_bytes: default_capture_bytes(),
            id_floor: default_id_floor(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

/// Success classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifyConfig {
    /// Media files smaller than this do not count as a download
    #[serde(default = "default_min_media_bytes")]
    pub min_media_bytes: u64,
    /// Recognized media extensions, without the dot
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
}

fn default_min_media_bytes() -> u64 {
    100 * 1024
}

fn default_media_extensions() -> Vec<String> {
    ["mp4", "mkv", "webm", "m4a", "mp3", "opus", "flv", "mov"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            min_media_bytes: default_min_media_bytes(),
            media_extensions: default_media_extensions(),
        }
    }
}

/// Input directory scanning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Regex matched against file names of exclude lists
    #[serde(default = "default_exclude_pattern")]
    pub exclude_pattern: String,
    /// Extensions of batch request files, without the dot
    #[serde(default = "default_input_extensions")]
    pub input_extensions: Vec<String>,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
}

fn default_exclude_pattern() -> String {
    r"^exclude.*\.txt$".to_string()
}

fn default_input_extensions() -> Vec<String> {
    vec!["txt".to_string()]
}

fn default_rescan_interval_secs() -> u64 {
    300
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_pattern: default_exclude_pattern(),
            input_extensions: default_input_extensions(),
            rescan_interval_secs: default_rescan_interval_secs(),
        }
    }
}

/// Periodic housekeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Total size cap of the output directory (0 = unlimited)
    #[serde(default)]
    pub max_output_bytes: u64,
    /// Reclaim space while the output filesystem has less free space (0 = disabled)
    #[serde(default)]
    pub min_free_bytes: u64,
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_summary_interval_secs() -> u64 {
    86_400
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_output_bytes: 0,
            min_free_bytes: 0,
            summary_interval_secs: default_summary_interval_secs(),
        }
    }
}

/// Worker supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Wall-clock ceiling for one downloader process (0 = none)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Upper bound of the worker restart backoff
    #[serde(default = "default_restart_backoff_max_secs")]
    pub restart_backoff_max_secs: u64,
}

fn default_job_timeout_secs() -> u64 {
    6 * 3600
}

fn default_restart_backoff_max_secs() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout_secs(),
            restart_backoff_max_secs: default_restart_backoff_max_secs(),
        }
    }
}

/// Read-only status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    /// Listen address, empty string disables the endpoint
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FETCHD_WORK_DIR -> paths.work_dir
    /// - FETCHD_SCAN_DIRS -> paths.scan_dirs (`:` separated)
    /// - FETCHD_BINARY -> downloader.binary
    /// - FETCHD_PROXY -> downloader.proxy (empty string clears it)
    /// - FETCHD_RATE_LIMIT -> downloader.rate_limit
    /// - FETCHD_TIMEOUT_SECS -> downloader.timeout_secs
    /// - FETCHD_MAX_PENDING -> queue.max_pending
    /// - FETCHD_MIN_MEDIA_BYTES -> classify.min_media_bytes
    /// - FETCHD_STATUS_BIND -> status.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FETCHD_WORK_DIR") {
            if !val.is_empty() {
                self.paths.work_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FETCHD_SCAN_DIRS") {
            self.paths.scan_dirs = val
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Ok(val) = env::var("FETCHD_BINARY") {
            if !val.is_empty() {
                self.downloader.binary = val;
            }
        }

        if let Ok(val) = env::var("FETCHD_PROXY") {
            self.downloader.proxy = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = env::var("FETCHD_RATE_LIMIT") {
            if let Ok(rate) = val.parse::<u64>() {
                self.downloader.rate_limit = rate;
            }
        }

        if let Ok(val) = env::var("FETCHD_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.downloader.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("FETCHD_MAX_PENDING") {
            if let Ok(depth) = val.parse::<usize>() {
                self.queue.max_pending = depth;
            }
        }

        if let Ok(val) = env::var("FETCHD_MIN_MEDIA_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.classify.min_media_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("FETCHD_STATUS_BIND") {
            self.status.bind = val;
        }
    }

    /// Check cross-field constraints once, at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dl = &self.downloader;

        if dl.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("downloader.binary is empty".into()));
        }
        if dl.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "downloader.timeout_secs must be greater than 0".into(),
            ));
        }
        if dl.supported_resolutions.is_empty() {
            return Err(ConfigError::Invalid(
                "downloader.supported_resolutions is empty".into(),
            ));
        }
        if !dl.supported_resolutions.contains(&dl.default_resolution) {
            return Err(ConfigError::UnsupportedResolution(dl.default_resolution));
        }
        if dl.playlist_min_items == 0 || dl.playlist_min_items > dl.playlist_max_items {
            return Err(ConfigError::Invalid(format!(
                "playlist item range [{}, {}] is empty",
                dl.playlist_min_items, dl.playlist_max_items
            )));
        }
        if dl.require_proxy && dl.proxy.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ProxyRequired);
        }
        if self.queue.max_pending == 0 {
            return Err(ConfigError::Invalid("queue.max_pending must be at least 1".into()));
        }
        if self.index.max_results == 0 {
            return Err(ConfigError::Invalid("index.max_results must be at least 1".into()));
        }
        if self.classify.media_extensions.is_empty() {
            return Err(ConfigError::Invalid("classify.media_extensions is empty".into()));
        }
        let bind = self.status.bind.trim();
        if !bind.is_empty() && bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "status.bind is not a socket address: {}",
                bind
            )));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Directory that holds one sub-directory per job
    pub fn output_dir(&self) -> PathBuf {
        self.paths
            .output_dir
            .clone()
            .unwrap_or_else(|| self.paths.work_dir.join("out"))
    }

    /// Location of the persisted result index
    pub fn index_file(&self) -> PathBuf {
        self.paths
            .index_file
            .clone()
            .unwrap_or_else(|| self.paths.work_dir.join("index.json"))
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.queue.recency_window_days.saturating_mul(86_400))
    }

    pub fn retry_failed_after(&self) -> Duration {
        Duration::from_secs(self.queue.retry_failed_after_secs)
    }
}
