//! Infrastructure layer for devbridge-device.
//!
//! - [`transport`] – the reconnecting WebSocket client.
//! - [`discovery`] – locating a bridge under a time budget.
//! - [`providers`] – file-backed and mock capture providers.

pub mod discovery;
pub mod providers;
pub mod transport;

pub use discovery::{Discovery, DiscoveredBridge, DiscoveryConfig, Prober, WsProber};
pub use transport::{
    BackoffPolicy, Transport, TransportConfig, TransportError, TransportEvent, TransportState,
};
