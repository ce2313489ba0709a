//! Broker configuration
//!
//! Loads listener settings, connection limits and identity rules from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default endpoint path for the WebSocket upgrade
pub const DEFAULT_PATH: &str = "/ws";

/// Time allowed to write a single frame to the peer
pub const DEFAULT_WRITE_WAIT_MS: u64 = 10_000;

/// Time allowed to read the next frame (including a pong) from the peer
pub const DEFAULT_PONG_WAIT_MS: u64 = 60_000;

/// Maximum inbound message size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Per-connection outbox capacity
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path accepted for the upgrade
    pub path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub write_wait_ms: u64,
    pub pong_wait_ms: u64,
    /// Keepalive period; 9/10 of the pong wait when unset
    pub ping_period_ms: Option<u64>,
    pub max_message_size: usize,
    pub outbox_capacity: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            write_wait_ms: DEFAULT_WRITE_WAIT_MS,
            pong_wait_ms: DEFAULT_PONG_WAIT_MS,
            ping_period_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl LimitsSection {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        match self.ping_period_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.pong_wait() * 9 / 10,
        }
    }
}

/// How the upgrade request is mapped to a display identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    /// Cookies consulted in order; the first non-empty one wins
    pub cookie_names: Vec<String>,
    /// Identity used when no cookie is present
    pub anonymous_name: String,
    /// Reject the upgrade instead of falling back to `anonymous_name`
    pub require_identity: bool,
    /// Cross-origin hosts accepted in addition to the request's own host
    pub allowed_origins: Vec<String>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            cookie_names: vec!["nickname".to_string(), "email".to_string()],
            anonymous_name: "anonymous".to_string(),
            require_identity: false,
            allowed_origins: Vec::new(),
        }
    }
}

/// Output format produced for each chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFormat {
    #[default]
    Json,
    Html,
}

/// Top-level broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerSection,
    pub limits: LimitsSection,
    pub identity: IdentitySection,
    pub render_format: RenderFormat,
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the listener address
    pub fn with_listener(mut self, bind: Option<String>, port: Option<u16>) -> Self {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Check limits for consistency
    pub fn validate(&self) -> ConfigResult<()> {
        let limits = &self.limits;

        if limits.write_wait_ms == 0 || limits.pong_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "write_wait_ms and pong_wait_ms must be positive".to_string(),
            ));
        }
        if limits.ping_period().is_zero() {
            return Err(ConfigError::Invalid(
                "ping_period_ms must be positive".to_string(),
            ));
        }
        // A ping has to reach the peer before our own read deadline fires.
        if limits.ping_period() >= limits.pong_wait() {
            return Err(ConfigError::Invalid(format!(
                "ping period ({:?}) must be shorter than pong wait ({:?})",
                limits.ping_period(),
                limits.pong_wait()
            )));
        }
        if limits.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be at least 1".to_string(),
            ));
        }
        if limits.outbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbox_capacity must be at least 1".to_string(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server path must start with '/': {}",
                self.server.path
            )));
        }

        Ok(())
    }
}
