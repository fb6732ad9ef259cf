use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TrawlError};

/// Main configuration structure for Trawl
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Entry store connection configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Replay executor configuration
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Live stream configuration
    #[serde(default)]
    pub stream: StreamConfig,
    /// Capture ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists, falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".trawl").join("config.toml")),
            dirs::config_dir().map(|c| c.join("trawl").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for candidate in default_paths.iter().flatten() {
            if candidate.exists() {
                tracing::info!("Loading config from: {}", candidate.display());
                return Self::from_file(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrawlError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| TrawlError::Config(format!("Failed to parse config: {e}")))
    }
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8898")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Request timeout in seconds for the REST surface
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8898".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Entry store connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Store host name or IP
    #[serde(default = "default_store_host")]
    pub host: String,
    /// Store TCP port
    #[serde(default = "default_store_port")]
    pub port: u16,
    /// Seconds to wait between insert-path reconnect attempts
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Maximum store size in bytes, applied once at startup
    #[serde(default = "default_size_limit_bytes")]
    pub size_limit_bytes: u64,
    /// Query applied by the store to every inserted entry (empty = keep all)
    #[serde(default)]
    pub insertion_filter: String,
    /// How long to wait for the store to accept connections at startup
    #[serde(default = "default_startup_deadline_secs")]
    pub startup_deadline_secs: u64,
}

impl StoreConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            size_limit_bytes: default_size_limit_bytes(),
            insertion_filter: String::new(),
            startup_deadline_secs: default_startup_deadline_secs(),
        }
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    9099
}

fn default_reconnect_interval_secs() -> u64 {
    3
}

fn default_size_limit_bytes() -> u64 {
    200 * 1024 * 1024
}

fn default_startup_deadline_secs() -> u64 {
    20
}

/// Replay executor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Maximum replays in flight across the whole process
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-replay request timeout in seconds
    #[serde(default = "default_replay_timeout_secs")]
    pub timeout_secs: u64,
}

impl ReplayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout_secs: default_replay_timeout_secs(),
        }
    }
}

fn default_max_parallel() -> usize {
    5
}

fn default_replay_timeout_secs() -> u64 {
    10
}

/// Live stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Buffered items per live feed before the store reader applies backpressure
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,
    /// Historical fetch timeout used when a subscriber sends none
    #[serde(default = "default_fetch_timeout_ms")]
    pub default_fetch_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            feed_buffer: default_feed_buffer(),
            default_fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

fn default_feed_buffer() -> usize {
    256
}

fn default_fetch_timeout_ms() -> u64 {
    3000
}

/// Capture ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Capture items buffered between the HTTP surface and the insert worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_queue_depth() -> usize {
    1024
}
