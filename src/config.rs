//! Configuration types for eodms-dl
//!
//! Every field has a default, so an empty TOML file (or [`Config::default`]) is a
//! usable configuration once credentials are supplied.

use crate::error::{Error, Result};
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection settings for the EODMS REST API (RAPI)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RapiConfig {
    /// Base URL of the RAPI (default: the public EODMS endpoint)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Username of the EODMS account
    #[serde(default)]
    pub username: Option<String>,

    /// Password of the EODMS account
    #[serde(default)]
    pub password: Option<String>,

    /// Timeout for search requests (default: 120 seconds)
    #[serde(default = "default_timeout_query", with = "duration_serde")]
    pub timeout_query: Duration,

    /// Timeout for order requests (default: 180 seconds)
    #[serde(default = "default_timeout_order", with = "duration_serde")]
    pub timeout_order: Duration,

    /// Timeout for a single order status request (default: 60 seconds)
    #[serde(default = "default_timeout_status", with = "duration_serde")]
    pub timeout_status: Duration,

    /// Longest a file transfer may wait for its response or for the next chunk
    /// (default: 600 seconds); a transfer that keeps receiving data never times out
    #[serde(default = "default_timeout_download", with = "duration_serde")]
    pub timeout_download: Duration,

    /// Results requested per search page (default: 150)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum number of results returned by a search (default: 1000)
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for RapiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: None,
            password: None,
            timeout_query: default_timeout_query(),
            timeout_order: default_timeout_order(),
            timeout_status: default_timeout_status(),
            timeout_download: default_timeout_download(),
            page_size: default_page_size(),
            max_results: default_max_results(),
        }
    }
}

/// Local directories
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where image files are written (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub downloads: PathBuf,

    /// Where results tables are written (default: "./results")
    #[serde(default = "default_results_dir")]
    pub results: PathBuf,

    /// Where the log file is written (None = console only)
    #[serde(default)]
    pub log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads: default_download_dir(),
            results: default_results_dir(),
            log: None,
        }
    }
}

/// Ordering limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderConfig {
    /// Maximum number of images to order (None = unlimited)
    ///
    /// When several collections are searched the limit applies to each collection.
    #[serde(default)]
    pub max_images: Option<usize>,

    /// Maximum number of images per order (default: 100)
    ///
    /// Zero or negative values fall back to the service default of 100.
    #[serde(default = "default_max_items_per_order")]
    pub max_items_per_order: i64,

    /// Priority sent with every order
    #[serde(default)]
    pub priority: Priority,

    /// Link records to orders placed in earlier sessions instead of ordering again
    #[serde(default = "default_true")]
    pub reuse_existing: bool,

    /// How many recent orders to inspect when looking for existing ones (default: 250)
    #[serde(default = "default_max_recent_orders")]
    pub max_recent_orders: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            max_images: None,
            max_items_per_order: default_max_items_per_order(),
            priority: Priority::default(),
            reuse_existing: true,
            max_recent_orders: default_max_recent_orders(),
        }
    }
}

/// Order status polling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between poll cycles (default: 30 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Upper bound for the delay when idle cycles stretch it (default: 5 minutes)
    #[serde(default = "default_poll_max_interval", with = "duration_serde")]
    pub max_interval: Duration,

    /// Growth factor applied after a cycle in which nothing became available (default: 1.5)
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff: f64,

    /// Unresolved cycles after which a record is abandoned (default: 20)
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            max_interval: default_poll_max_interval(),
            idle_backoff: default_idle_backoff(),
            max_attempts: default_poll_attempts(),
        }
    }
}

/// File transfer behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum concurrent transfers (default: 2)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Download again records that a previous run already downloaded
    #[serde(default)]
    pub force: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            force: false,
        }
    }
}

/// Retry configuration for transient failures
///
/// Shared by order submission, status polling and file transfers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 4)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration
///
/// Mirrors the sections of the TOML file:
///
/// ```toml
/// [rapi]
/// username = "me"
/// password = "secret"
///
/// [order]
/// max_images = 120
/// max_items_per_order = 50
///
/// [poll]
/// interval = 60
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// RAPI connection settings
    #[serde(default)]
    pub rapi: RapiConfig,

    /// Local directories
    #[serde(default)]
    pub paths: PathsConfig,

    /// Ordering limits
    #[serde(default)]
    pub order: OrderConfig,

    /// Status polling
    #[serde(default)]
    pub poll: PollConfig,

    /// File transfers
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy for remote calls
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load a configuration file in TOML format
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
            key: None,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config {
            message: e.to_string(),
            key: None,
        })
    }

    /// Check the settings a run cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.rapi.username.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config("rapi.username", "an EODMS username is required"));
        }
        if self.rapi.password.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config("rapi.password", "an EODMS password is required"));
        }
        if url::Url::parse(&self.rapi.base_url).is_err() {
            return Err(Error::config(
                "rapi.base_url",
                format!("'{}' is not a valid URL", self.rapi.base_url),
            ));
        }
        if self.download.concurrency == 0 {
            return Err(Error::config(
                "download.concurrency",
                "at least one concurrent transfer is required",
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(Error::config(
                "poll.max_attempts",
                "at least one poll attempt is required",
            ));
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "https://www.eodms-sgdot.nrcan-rncan.gc.ca/wes/rapi".to_string()
}

fn default_timeout_query() -> Duration {
    Duration::from_secs(120)
}

fn default_timeout_order() -> Duration {
    Duration::from_secs(180)
}

fn default_timeout_status() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout_download() -> Duration {
    Duration::from_secs(600)
}

fn default_page_size() -> usize {
    150
}

fn default_max_results() -> usize {
    1000
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_max_items_per_order() -> i64 {
    crate::batcher::DEFAULT_MAX_ITEMS_PER_ORDER as i64
}

fn default_max_recent_orders() -> usize {
    250
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_max_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_idle_backoff() -> f64 {
    1.5
}

fn default_poll_attempts() -> u32 {
    20
}

fn default_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
