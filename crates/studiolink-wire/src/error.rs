//! Errors from the wire protocol layer.

use serde::{Deserialize, Serialize};
use studiolink_types::TransportError;
use thiserror::Error;

/// Framing and encoding errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 transfer buffer: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type WireResult<T> = Result<T, WireError>;

/// An error thrown by a remote handler, in its serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct RemoteError {
    /// Error class name, e.g. `TypeError`.
    #[serde(default = "default_error_name")]
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Substituted when a thrown value arrives without a recognizable shape.
    pub fn unknown() -> Self {
        Self::new("Error", "An unknown error occurred")
    }
}

/// Why a call did not produce a value.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No response arrived within the call's timeout.
    #[error("Call '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The remote handler threw.
    #[error("Remote handler failed: {0}")]
    Remote(RemoteError),

    /// The request could not be sent.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection closed while the call was outstanding.
    #[error("Connection closed before a response arrived")]
    Disconnected,
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// The remote error, if the handler threw.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}
