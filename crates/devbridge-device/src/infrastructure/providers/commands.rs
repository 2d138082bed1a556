//! Commands every agent answers without app integration.

use async_trait::async_trait;
use devbridge_core::protocol::now_millis;
use serde_json::{json, Value};

use crate::application::capture::{CommandError, CommandExecutor};

/// `ping` answers with the device clock; `echo` returns its params.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCommands;

#[async_trait]
impl CommandExecutor for BuiltinCommands {
    async fn execute(&self, name: &str, params: &Value) -> Result<Value, CommandError> {
        match name {
            "ping" => Ok(json!({ "pong": true, "timestamp": now_millis() })),
            "echo" => Ok(params.clone()),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
