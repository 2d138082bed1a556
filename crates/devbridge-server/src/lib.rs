//! devbridge-server library crate.
//!
//! The bridge between a tool-calling agent and the mobile apps running the
//! DevBridge device agent.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! agent adapter ──► Bridge (application/bridge_service)
//!                     ├── screenshot cache / context cache
//!                     └── Correlator ──► ConnectionManager ◄──WebSocket── devices
//! ```
//!
//! - `domain` – configuration and the error taxonomy (no I/O).
//! - `application` – correlator, caches, handlers, and the `Bridge` facade.
//! - `infrastructure` – WebSocket accept loop, per-connection tasks,
//!   heartbeat, and the connection event bus.
//!
//! The binary entry point (`main.rs`) and the integration tests in `tests/`
//! share this module tree.

/// Domain layer: configuration and error types.
pub mod domain;

/// Application layer: request correlation, caching, and the bridge facade.
pub mod application;

/// Infrastructure layer: WebSocket connections and events.
pub mod infrastructure;

pub use application::{Bridge, BridgeStatus, DeviceSummary, StartError};
pub use domain::{BridgeConfig, BridgeError, CacheConfig, RequestError};
