//! Device agent configuration.
//!
//! [`DeviceConfig`] holds everything the agent needs: who it is, where the
//! bridge is (or how to look for it), how hard to retry, and where the
//! standalone binary reads its frames and snapshots from.
//!
//! ```toml
//! bridge_url = "ws://192.168.1.20:8347"
//! heartbeat_interval_ms = 15000
//!
//! [device]
//! device_id = "pixel-7"
//! name = "Pixel 7"
//! platform = "android"
//!
//! [discovery]
//! timeout_ms = 5000
//! default_ports = [8347]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the bridge listens on unless told otherwise.
pub const DEFAULT_BRIDGE_PORT: u16 = 8347;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How this device describes itself to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub name: String,
    pub platform: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            name: "devbridge-device".to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Where and how long to look for a bridge when no URL is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Global budget across every strategy.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Deadline for a single probe.
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,
    /// How long an open probe waits for a metadata reply before accepting
    /// the bare handshake.
    #[serde(rename = "metadata_wait_ms", with = "duration_ms")]
    pub metadata_wait: Duration,
    pub default_ports: Vec<u16>,
    pub dev_ports: Vec<u16>,
    pub loopback_hosts: Vec<String>,
    /// Private subnet prefixes such as `"192.168.1"`.
    pub subnets: Vec<String>,
    /// Last octets probed on each subnet.
    pub subnet_hosts: Vec<u8>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(1500),
            metadata_wait: Duration::from_millis(300),
            default_ports: vec![DEFAULT_BRIDGE_PORT],
            dev_ports: vec![8080, 8081, 3000, 8000, 9000],
            // 10.0.2.2 / 10.0.3.2 are the host machine as seen from the
            // Android emulator and Genymotion.
            loopback_hosts: ["127.0.0.1", "localhost", "10.0.2.2", "10.0.3.2"]
                .iter()
                .map(|h| (*h).to_string())
                .collect(),
            subnets: ["192.168.0", "192.168.1", "10.0.0"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            subnet_hosts: vec![1, 2, 100, 101, 102, 103, 104, 105],
        }
    }
}

/// All runtime configuration for the device agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bridge address (`ws://host:port` or `host:port`).  When set it is
    /// verified first; when unset discovery searches for one.
    pub bridge_url: Option<String>,

    pub device: DeviceIdentity,

    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Period of the application-level `HEARTBEAT` envelope.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    #[serde(rename = "reconnect_base_ms", with = "duration_ms")]
    pub reconnect_base: Duration,
    #[serde(rename = "reconnect_max_delay_ms", with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    pub reconnect_attempts: u32,

    /// Envelopes buffered by `send_or_queue` while disconnected.
    pub queue_capacity: usize,

    pub max_payload_bytes: usize,

    pub discovery: DiscoverySettings,

    /// Image served as the screen by the standalone binary.
    pub screenshot_file: Option<PathBuf>,
    /// JSON UI snapshot served by the standalone binary.
    pub snapshot_file: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            device: DeviceIdentity::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_base: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_attempts: 10,
            queue_capacity: 100,
            max_payload_bytes: 64 * 1024 * 1024,
            discovery: DiscoverySettings::default(),
            screenshot_file: None,
            snapshot_file: None,
        }
    }
}

impl DeviceConfig {
    /// Parses a TOML document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML and
    /// [`ConfigError::Invalid`] for values that fail validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`DeviceConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval_ms", "must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout_ms", "must be greater than zero"));
        }
        if self.reconnect_base.is_zero() || self.reconnect_max_delay < self.reconnect_base {
            return Err(invalid(
                "reconnect_base_ms",
                "must be non-zero and not exceed reconnect_max_delay_ms",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.max_payload_bytes == 0 {
            return Err(invalid("max_payload_bytes", "must be greater than zero"));
        }
        if self.discovery.probe_timeout.is_zero() {
            return Err(invalid("discovery.probe_timeout_ms", "must be greater than zero"));
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
