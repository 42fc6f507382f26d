//! Application configuration management.
//!
//! Handles loading, saving, and accessing the client configuration:
//! API and WebSocket endpoints, HTTP retry tuning, socket reconnect and
//! heartbeat tuning, offline queue routing, and local storage. Configuration
//! is persisted as TOML on disk and can be overridden from the environment.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::constants;
use crate::error::{FleetError, FleetResult};
use crate::platform::Platform;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// WebSocket reconnect and heartbeat settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// HTTP retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Offline action queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Notification settings.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL for the REST API (e.g., "https://api.fleet.example.com/api").
    #[serde(default)]
    pub api_base_url: String,

    /// WebSocket endpoint (e.g., "wss://api.fleet.example.com/ws").
    #[serde(default)]
    pub ws_url: String,

    /// API request timeout in milliseconds.
    #[serde(default = "default_api_timeout")]
    pub api_timeout_ms: u64,

    /// TCP/TLS connect timeout in milliseconds, shared by HTTP and WebSocket.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// Optional `userType` query parameter for the socket URL (e.g. "driver").
    #[serde(default)]
    pub user_type: Option<String>,
}

/// WebSocket connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect attempts before the connection is declared failed.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect attempt, doubled on each attempt.
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    /// Jitter factor (0.0 to 1.0) applied to reconnect delays. 0 disables jitter.
    #[serde(default)]
    pub jitter_factor: f64,

    /// Idle time before a client ping is sent.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Time allowed for any frame to arrive after a client ping.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Topics declared at startup, before any consumer mounts.
    #[serde(default)]
    pub topics: Vec<String>,
}

/// HTTP retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Multiplier applied to the delay for each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Optional cap on a single retry delay.
    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,
}

/// Offline action queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Replay the queue whenever the socket reaches the connected state.
    #[serde(default = "default_true")]
    pub drain_on_connect: bool,

    /// Replay attempts before an action is rejected. 0 means unlimited.
    #[serde(default)]
    pub max_replay_attempts: u32,

    /// Action kind to `"METHOD /path"` overrides, merged over the built-in routes.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Raise a platform notification for critical fleet alerts.
    #[serde(default = "default_true")]
    pub critical_alerts: bool,

    /// Play the platform sound with critical alert notifications.
    #[serde(default = "default_true")]
    pub sound: bool,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. If empty, uses default location.
    #[serde(default)]
    pub path: String,

    /// Enable WAL (Write-Ahead Logging) mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Run integrity check on startup.
    #[serde(default = "default_true")]
    pub integrity_check_on_startup: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output.
    #[serde(default)]
    pub json_output: bool,
}

// Default value functions for serde

fn default_api_timeout() -> u64 {
    constants::DEFAULT_API_TIMEOUT_MS
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay() -> u64 {
    5_000
}

fn default_reconnect_max_delay() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_pong_timeout() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            ws_url: String::new(),
            api_timeout_ms: default_api_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            custom_headers: HashMap::new(),
            user_type: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            jitter_factor: 0.0,
            heartbeat_interval_ms: default_heartbeat_interval(),
            pong_timeout_ms: default_pong_timeout(),
            topics: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_on_connect: true,
            max_replay_attempts: 0,
            routes: BTreeMap::new(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            critical_alerts: true,
            sound: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            wal_mode: true,
            pool_size: default_pool_size(),
            integrity_check_on_startup: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl ServerConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default config file path, then apply
    /// environment overrides.
    pub fn load_default() -> FleetResult<Self> {
        let path = Self::default_config_path()?;
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> FleetResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&contents)?;
        config.server.api_base_url = Self::sanitize_url(&config.server.api_base_url);
        config.server.ws_url = Self::sanitize_url(&config.server.ws_url);
        Ok(config)
    }

    /// Save configuration to the default config file path.
    pub fn save_default(&self) -> FleetResult<()> {
        let path = Self::default_config_path()?;
        self.save_to_file(&path)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> FleetResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| FleetError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> FleetResult<PathBuf> {
        Ok(Platform::config_dir()?.join("config.toml"))
    }

    /// Get the effective database path, using the configured path or the default.
    pub fn effective_db_path(&self) -> FleetResult<PathBuf> {
        if self.database.path.is_empty() {
            Ok(Platform::data_dir()?.join(constants::DB_FILE_NAME))
        } else {
            Ok(PathBuf::from(&self.database.path))
        }
    }

    /// Get the effective log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> FleetResult<PathBuf> {
        if self.logging.directory.is_empty() {
            Ok(Platform::data_dir()?.join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }

    /// Check whether both endpoints are configured.
    pub fn is_server_configured(&self) -> bool {
        !self.server.api_base_url.is_empty() && !self.server.ws_url.is_empty()
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using the given lookup. Unparseable values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(constants::env::API_URL) {
            self.server.api_base_url = Self::sanitize_url(&v);
        }
        if let Some(v) = lookup(constants::env::WS_URL) {
            self.server.ws_url = Self::sanitize_url(&v);
        }
        if let Some(v) = lookup(constants::env::MAX_RECONNECT_ATTEMPTS).and_then(|v| v.parse().ok()) {
            self.connection.max_reconnect_attempts = v;
        }
        if let Some(v) = lookup(constants::env::MAX_RETRIES).and_then(|v| v.parse().ok()) {
            self.retry.max_retries = v;
        }
        if let Some(v) = lookup(constants::env::RETRY_DELAY_MS).and_then(|v| v.parse().ok()) {
            self.retry.retry_delay_ms = v;
        }
        if let Some(v) = lookup(constants::env::BACKOFF_MULTIPLIER).and_then(|v| v.parse().ok()) {
            self.retry.backoff_multiplier = v;
        }
        if let Some(v) = lookup(constants::env::LOG_LEVEL) {
            self.logging.level = v;
        }
        debug!("environment overrides applied");
    }

    /// Sanitize and normalize an endpoint URL.
    ///
    /// Strips surrounding whitespace and quotes, and trailing slashes.
    pub fn sanitize_url(url: &str) -> String {
        url.trim()
            .trim_matches('"')
            .trim()
            .trim_end_matches('/')
            .to_string()
    }
}

/// Thread-safe configuration holder for shared access across services.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<AppConfig>>,
}

impl ConfigHandle {
    /// Create a new configuration handle.
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Read the configuration.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, AppConfig> {
        self.inner.read().await
    }

    /// Write/update the configuration.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, AppConfig> {
        self.inner.write().await
    }

    /// Clone the current configuration.
    pub async fn snapshot(&self) -> AppConfig {
        self.inner.read().await.clone()
    }

    /// Save the current configuration to disk.
    pub async fn save(&self) -> FleetResult<()> {
        let config = self.inner.read().await;
        config.save_default()
    }
}
