use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::Command;

pub const ACTION_CONNECTED: &str = "connected";
pub const ACTION_NEW_COMMANDS: &str = "new_commands";
pub const ACTION_OUTPUT_COMMAND: &str = "output_command";
pub const ACTION_UPDATE_COMMAND: &str = "update_command";

/// Subscription frame sent after the controller acknowledges the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewCommandsRequest {
    pub action: String,
    pub server_id: String,
}

impl NewCommandsRequest {
    pub fn new(server_id: &str) -> Self {
        Self {
            action: ACTION_NEW_COMMANDS.to_string(),
            server_id: server_id.to_string(),
        }
    }
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handshake acknowledgement; the agent should subscribe for commands.
    Connected,
    /// New work from the controller.
    NewCommands(Command),
    /// Informational echo, logged only.
    OutputEcho(Value),
    /// Controller acknowledgement of one of our own updates, logged only.
    UpdateEcho(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no action field")]
    MissingAction,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("new_commands frame has no new_val payload")]
    MissingNewVal,
}

/// Parse an inbound text frame and classify it by its `action` tag.
///
/// Every failure here is fatal to the session: an unparseable frame or an
/// unrecognized action is treated as desynchronization, not noise.
pub fn classify(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingAction)?;
    match action {
        ACTION_CONNECTED => Ok(Inbound::Connected),
        ACTION_NEW_COMMANDS => {
            let new_val = value
                .get("new_val")
                .cloned()
                .ok_or(ProtocolError::MissingNewVal)?;
            let command: Command = serde_json::from_value(new_val)
                .map_err(|err| ProtocolError::Decode(err.to_string()))?;
            Ok(Inbound::NewCommands(command))
        }
        ACTION_OUTPUT_COMMAND => Ok(Inbound::OutputEcho(value)),
        ACTION_UPDATE_COMMAND => Ok(Inbound::UpdateEcho(value)),
        other => Err(ProtocolError::UnknownAction(other.to_string())),
    }
}

/// Encode an outbound frame as a JSON text payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|err| ProtocolError::Encode(err.to_string()))
}

/// Render a binary frame as a space-separated hex dump for diagnostic display.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
