//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It can be built from defaults, from a TOML file, or from CLI arguments
//! (see `main.rs`); the bridge itself never reads the environment.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8347"
//! heartbeat_interval_ms = 15000
//! max_connections = 32
//!
//! [screenshot_cache]
//! capacity = 20
//! ttl_ms = 60000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bridge port; devices probe it first during discovery.
pub const DEFAULT_PORT: u16 = 8347;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but makes no sense (zero capacity, zero interval).
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Capacity and freshness limits for one response cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries; the oldest insertion is evicted beyond it.
    pub capacity: usize,
    /// Maximum age at which an entry is still served.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// How often expired entries are swept even if nobody asks for them.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl CacheConfig {
    /// Rendered frames change slowly relative to how often agents ask for them.
    pub fn screenshot_default() -> Self {
        Self {
            capacity: 20,
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }

    /// UI state churns quickly; see also the hard ceiling in `context_cache`.
    pub fn context_default() -> Self {
        Self {
            capacity: 50,
            ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::screenshot_default()
    }
}

/// All runtime configuration for the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// The address and port the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Period of transport-level pings; a connection silent for twice this
    /// long is closed as dead.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Connections accepted beyond this are refused with `CONNECTION_LIMIT`.
    pub max_connections: usize,

    /// Ceiling for a single inbound WebSocket message.  Screenshots can be
    /// tens of megabytes, so keep this generous.
    pub max_payload_bytes: usize,

    /// Deadline for a request issued to a device.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,

    pub screenshot_cache: CacheConfig,
    pub context_cache: CacheConfig,
}

impl Default for BridgeConfig {
    /// | Field              | Default          |
    /// |--------------------|------------------|
    /// | listen_addr        | `0.0.0.0:8347`   |
    /// | heartbeat_interval | 15 seconds       |
    /// | max_connections    | 32               |
    /// | max_payload_bytes  | 64 MiB           |
    /// | request_timeout    | 30 seconds       |
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat_interval: Duration::from_secs(15),
            max_connections: 32,
            max_payload_bytes: 64 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            screenshot_cache: CacheConfig::screenshot_default(),
            context_cache: CacheConfig::context_default(),
        }
    }
}

impl BridgeConfig {
    /// Parses a TOML document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML and
    /// [`ConfigError::Invalid`] for values that fail [`BridgeConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`BridgeConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Rejects values that would make a component spin or refuse all work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval_ms", "must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout_ms", "must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.max_payload_bytes == 0 {
            return Err(invalid("max_payload_bytes", "must be greater than zero"));
        }
        for (field, cache) in [
            ("screenshot_cache", &self.screenshot_cache),
            ("context_cache", &self.context_cache),
        ] {
            if cache.capacity == 0 {
                return Err(invalid(field, "capacity must be at least 1"));
            }
            if cache.sweep_interval.is_zero() {
                return Err(invalid(field, "sweep_interval_ms must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Serde helper: `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
