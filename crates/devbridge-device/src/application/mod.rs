//! Application layer for devbridge-device.
//!
//! - [`capture`] – the provider traits a host app implements.
//! - [`dispatcher`] – turns bridge requests into provider calls and replies.
//! - [`agent`] – discovery, connection, and the request loop.

pub mod agent;
pub mod capture;
pub mod dispatcher;

pub use agent::{AgentError, AgentStatus, DeviceAgent};
pub use capture::{CaptureError, CommandError, CommandExecutor, ScreenCapture, UiSnapshotProvider};
pub use dispatcher::RequestDispatcher;
