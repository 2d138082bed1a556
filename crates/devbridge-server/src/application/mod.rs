//! Application layer for devbridge-server.
//!
//! Request semantics on top of the raw connection stream.  Nothing here opens
//! a socket; the correlator talks to connections through the
//! [`correlator::EnvelopeSink`] trait and finds devices through
//! [`handlers::DeviceDirectory`], both implemented by the infrastructure's
//! `ConnectionManager`.
//!
//! # Sub-modules
//!
//! - **`correlator`** – Pending-request table; pairs responses by id, fails
//!   requests on timeout or disconnect, routes inbound requests to handlers.
//! - **`cache`** – Generic TTL + FIFO-capacity cache with single-flight fetches.
//! - **`context_cache`** – Snapshot cache: capped TTL, telemetry updates, tree
//!   compression.
//! - **`handlers`** – The default handlers (forward, command/telemetry,
//!   discovery, heartbeat).
//! - **`bridge_service`** – The [`Bridge`] facade the agent adapter calls.

pub mod bridge_service;
pub mod cache;
pub mod context_cache;
pub mod correlator;
pub mod handlers;

pub use bridge_service::{Bridge, BridgeStatus, DeviceSummary, StartError};
pub use cache::{cache_key, CacheStats, ResponseCache};
pub use context_cache::ContextCache;
pub use correlator::{Correlator, EnvelopeHandler, EnvelopeSink};
pub use handlers::DeviceDirectory;
