//! Infrastructure layer for devbridge-server.
//!
//! Everything that touches a socket lives here: the WebSocket accept loop,
//! per-connection reader/writer tasks, the heartbeat, and the event bus that
//! hands decoded envelopes to the application layer.

pub mod connection_manager;
pub mod events;

pub use connection_manager::{
    ConnectionManager, ConnectionManagerConfig, ConnectionSnapshot, ConnectionState, NetworkError,
    SERVER_VERSION,
};
pub use events::{CloseReason, ConnectionEvent, ConnectionId, EventBus, Subscription};
