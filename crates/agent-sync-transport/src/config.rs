//! Client configuration.
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. Environment variables: `AGENT_SYNC_URL`, `AGENT_SYNC_PORT`
//! 2. Config file: an explicit path, else `<config_dir>/agent-sync/config.toml`
//! 3. Compiled defaults
//!
//! ```toml
//! [connection]
//! url = "ws://127.0.0.1:8000/ws"   # or host + port
//! host = "127.0.0.1"
//! port = 8000
//! connect_timeout_ms = 10000
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_attempts = 5                 # omit for unbounded retries
//!
//! [routing]
//! code_execution_tool = "exec_code"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const URL_ENV: &str = "AGENT_SYNC_URL";
pub const PORT_ENV: &str = "AGENT_SYNC_PORT";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnect: BackoffPolicy,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Full endpoint URL. Takes precedence over `host` and `port`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout for a single connection attempt (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Reconnection backoff.
///
/// The delay before attempt `n` is `min(base * 2^n, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Stop retrying after this many attempts. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Router settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Tool whose invocations are tracked as code executions.
    #[serde(default = "default_code_execution_tool")]
    pub code_execution_tool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_port() -> u16 {
    8000
}
const fn default_connect_timeout_ms() -> u64 {
    10_000
}
const fn default_base_delay_ms() -> u64 {
    1000
}
const fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_code_execution_tool() -> String {
    "exec_code".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            code_execution_tool: default_code_execution_tool(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientConfig {
    /// Load configuration: env vars > file > defaults.
    ///
    /// An explicit `path` must exist. Without one, the per-user config file
    /// is used when present.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an environment
    /// override is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_path().filter(|p| p.exists()),
        };
        let mut config = match file {
            Some(p) => {
                let content = std::fs::read_to_string(&p)
                    .map_err(|source| ConfigError::Io { path: p, source })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid configuration TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns error if `AGENT_SYNC_PORT` is not a port number.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(URL_ENV) {
            self.connection.url = Some(url);
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.connection.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: PORT_ENV,
                value: port,
            })?;
        }
        Ok(())
    }

    /// The endpoint URL. Scheme must be `ws` or `wss`.
    ///
    /// # Errors
    /// Returns error if the URL does not parse or has another scheme.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let raw = self.connection.url.clone().unwrap_or_else(|| {
            format!("ws://{}:{}/ws", self.connection.host, self.connection.port)
        });
        let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        Ok(url)
    }
}

/// `<config_dir>/agent-sync/config.toml`
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agent-sync").join("config.toml"))
}
