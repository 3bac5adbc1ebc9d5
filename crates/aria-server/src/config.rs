//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Speech-provider settings.
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Relay tunables.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "aria_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Speech-provider connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    /// API key for the speech provider. Required at startup; usually set
    /// via `ARIA_PROVIDER_API_KEY` rather than the config file.
    #[serde(default)]
    pub api_key: String,

    /// HTTP base URL for voice-management calls.
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    /// WebSocket base URL for the per-session audio stream.
    #[serde(default = "default_provider_ws_url")]
    pub ws_base_url: String,
}

/// Relay tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Safety-configuration cache TTL, in seconds.
    #[serde(default = "default_config_ttl_secs")]
    pub config_ttl_secs: u64,

    /// Per-receive idle timeout on either relay leg, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Minimum wall-clock interval between in-flight quota checks, in
    /// seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "aria.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_provider_base_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}

fn default_provider_ws_url() -> String {
    "wss://api.elevenlabs.io/v1".to_string()
}

fn default_config_ttl_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_check_interval_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            config_ttl_secs: default_config_ttl_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `ARIA_HOST` overrides `server.host`
/// - `ARIA_PORT` overrides `server.port`
/// - `ARIA_DB_PATH` overrides `database.path`
/// - `ARIA_LOG_LEVEL` overrides `logging.level`
/// - `ARIA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `ARIA_PROVIDER_API_KEY` overrides `provider.api_key`
/// - `ARIA_PROVIDER_BASE_URL` overrides `provider.base_url`
/// - `ARIA_PROVIDER_WS_URL` overrides `provider.ws_base_url`
/// - `ARIA_CONFIG_TTL_SECS` overrides `relay.config_ttl_secs`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("ARIA_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("ARIA_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("ARIA_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("ARIA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("ARIA_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(key) = std::env::var("ARIA_PROVIDER_API_KEY") {
        config.provider.api_key = key;
    }
    if let Ok(url) = std::env::var("ARIA_PROVIDER_BASE_URL") {
        config.provider.base_url = url;
    }
    if let Ok(url) = std::env::var("ARIA_PROVIDER_WS_URL") {
        config.provider.ws_base_url = url;
    }
    if let Ok(ttl) = std::env::var("ARIA_CONFIG_TTL_SECS") {
        if let Ok(parsed) = ttl.parse() {
            config.relay.config_ttl_secs = parsed;
        }
    }

    Ok(config)
}
