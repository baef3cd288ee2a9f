//! Application configuration for eventstream-router.
//!
//! User config lives at `~/.eventstream-router/eventstream-router.toml`
//! unless `--config` points elsewhere.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, RouterError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "eventstream-router.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".eventstream-router";

// ---------------------------------------------------------------------------
// Config structs (matching eventstream-router.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Event feed subscription.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Resumption checkpoint.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Route manifest and per-route resources.
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Pipeline restart policy.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Out-of-band operator notification.
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// `[stream]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Base URL of the server-sent-events endpoint.
    #[serde(default = "default_stream_url")]
    pub url: String,

    /// User-Agent header; the remote service rejects anonymous clients.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Checkpoints older than this many days are ignored on resume.
    #[serde(default = "default_freshness_days")]
    pub freshness_days: u32,

    /// Fixed wait after a 429 before resubscribing.
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,

    /// First delay of the transport error backoff.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Cap of the transport error backoff.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// TCP/TLS connect timeout. The stream itself has no total timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Events buffered between the connector and the dispatcher.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            user_agent: default_user_agent(),
            freshness_days: default_freshness_days(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            connect_timeout_secs: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.freshness_days))
    }
}

fn default_stream_url() -> String {
    "https://stream.wikimedia.org/v2/stream/recentchange".into()
}
fn default_user_agent() -> String {
    concat!("eventstream-router/", env!("CARGO_PKG_VERSION")).into()
}
fn default_freshness_days() -> u32 {
    7
}
fn default_rate_limit_cooldown() -> u64 {
    5
}
fn default_backoff_initial() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    1024
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Plain-text file holding the last seen event timestamp.
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// How often the in-memory checkpoint is flushed to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl CheckpointConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("last-seen.txt")
}
fn default_flush_interval() -> u64 {
    1_000
}

/// `[routes]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// JSON manifest mapping route names to locators.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Directory for per-route log streams and the routing audit log.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Maximum concurrently running workers per route.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Events a route may have waiting for a worker; further events for
    /// that route are dropped and counted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            log_dir: default_log_dir(),
            max_in_flight: default_max_in_flight(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_manifest() -> PathBuf {
    PathBuf::from("routes.json")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_max_in_flight() -> usize {
    16
}
fn default_queue_capacity() -> usize {
    1024
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Pause between a pipeline failure and its restart.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_secs: default_restart_delay(),
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

fn default_restart_delay() -> u64 {
    5
}

/// `[alerts]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Shell command run with the error report on stdin when the process
    /// fails outside the supervised pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Upper bound for `stream.freshness_days`, roughly ten years.
const MAX_FRESHNESS_DAYS: u32 = 3650;

impl AppConfig {
    /// Reject values the router cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.stream.url).map_err(|e| {
            RouterError::config(format!("invalid stream url '{}': {e}", self.stream.url))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RouterError::config(format!(
                "stream url must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if self.stream.user_agent.trim().is_empty() {
            return Err(RouterError::config("stream.user_agent must not be empty"));
        }
        if self.stream.freshness_days == 0 || self.stream.freshness_days > MAX_FRESHNESS_DAYS {
            return Err(RouterError::config(format!(
                "stream.freshness_days must be between 1 and {MAX_FRESHNESS_DAYS}"
            )));
        }
        if self.stream.backoff_initial_ms == 0 {
            return Err(RouterError::config("stream.backoff_initial_ms must be > 0"));
        }
        if self.stream.backoff_max_ms < self.stream.backoff_initial_ms {
            return Err(RouterError::config(
                "stream.backoff_max_ms must not be below stream.backoff_initial_ms",
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(RouterError::config("stream.channel_capacity must be > 0"));
        }
        if self.routes.max_in_flight == 0 {
            return Err(RouterError::config("routes.max_in_flight must be > 0"));
        }
        if self.routes.queue_capacity == 0 {
            return Err(RouterError::config("routes.queue_capacity must be > 0"));
        }
        if self.checkpoint.flush_interval_ms == 0 {
            return Err(RouterError::config(
                "checkpoint.flush_interval_ms must be > 0",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.eventstream-router/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RouterError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.eventstream-router/eventstream-router.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RouterError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RouterError::config(format!("failed to parse {}: {e}", path.display())))
}
