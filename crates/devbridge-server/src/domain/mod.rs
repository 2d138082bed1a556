//! Domain layer for devbridge-server.
//!
//! Pure types with no I/O: the bridge configuration and the error taxonomy
//! that every public operation reports through.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - File I/O other than the explicit `BridgeConfig::load`

pub mod config;
pub mod error;

pub use config::{BridgeConfig, CacheConfig, ConfigError};
pub use error::{BridgeError, RequestError};
