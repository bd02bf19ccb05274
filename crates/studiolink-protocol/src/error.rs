//! Errors surfaced by the connection facade.

use studiolink_wire::{RemoteError, RpcError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    /// The command is not in the catalog this connection was built with.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("Payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A serialized payload arrived as something other than text.
    #[error("Malformed payload for '{command}': expected serialized text")]
    MalformedPayload { command: String },
    /// Raised by a `prepare` or `handle_response` hook.
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Rpc(e) if e.is_timeout())
    }

    /// The remote handler's error, if that is what failed the call.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CommandError::Rpc(e) => e.remote(),
            _ => None,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
