//! Implementations of the capture, snapshot, and command traits.
//!
//! - `file` – reads frames and snapshots from disk (standalone binary).
//! - `commands` – the built-in `ping` / `echo` commands.
//! - `mock` – recording fakes for tests.

pub mod commands;
pub mod file;
pub mod mock;

pub use commands::BuiltinCommands;
pub use file::{FileScreenCapture, JsonSnapshotProvider, Unavailable};
