//! # devbridge-device
//!
//! The device side of DevBridge: runs inside (or next to) a mobile app,
//! finds the bridge, keeps a connection to it alive, and answers its
//! screenshot, context, and command requests from native providers.
//!
//! # Architecture
//!
//! - **`domain`** – [`DeviceConfig`].
//! - **`application`** – provider traits, the [`RequestDispatcher`], and the
//!   [`DeviceAgent`] that wires everything together.
//! - **`infrastructure`** – the reconnecting [`Transport`], bridge
//!   [`Discovery`], and provider implementations.
//!
//! [`Transport`]: infrastructure::transport::Transport
//! [`Discovery`]: infrastructure::discovery::Discovery

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{AgentError, DeviceAgent, RequestDispatcher};
pub use domain::DeviceConfig;
