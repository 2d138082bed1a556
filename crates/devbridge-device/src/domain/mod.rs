//! Domain layer for devbridge-device: configuration only, no I/O besides
//! the explicit `DeviceConfig::load`.

pub mod config;

pub use config::{ConfigError, DeviceConfig, DeviceIdentity, DiscoverySettings, DEFAULT_BRIDGE_PORT};
