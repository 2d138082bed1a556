//! # devbridge-core
//!
//! Shared library for DevBridge containing the envelope wire format, the
//! typed payloads, the stable error codes, and the cancellable task handle
//! used for every timer.
//!
//! This crate is used by both the bridge (`devbridge-server`) and the device
//! agent (`devbridge-device`).  It opens no sockets.
//!
//! # Architecture overview
//!
//! DevBridge lets a remote tool-calling agent read live state from a running
//! mobile app without holding a connection to the device itself:
//!
//! ```text
//! agent ──► bridge (devbridge-server) ◄──WebSocket── device (devbridge-device)
//! ```
//!
//! - **`protocol`** – The [`Envelope`]: `{type, id, timestamp, data?, error?}`.
//!   A response always echoes the id of the request it answers; that is the
//!   only pairing mechanism.
//!
//! - **`task`** – [`task::ScheduledTask`], a spawned task that is aborted when
//!   its owner drops it.

pub mod protocol;
pub mod task;

pub use protocol::envelope::{decode_envelope, encode_envelope, Envelope, MessageType, ProtocolError};
pub use protocol::error_code::ErrorCode;
