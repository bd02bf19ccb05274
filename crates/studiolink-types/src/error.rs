//! Shared error types.

use crate::peer::{ClientRole, PeerId};
use thiserror::Error;

/// A discovery or registry bug. These are never transient and are surfaced
/// immediately instead of being degraded into a silent failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A connection was requested or created for a peer that is not listed
    /// as available.
    #[error("Peer is not available: {0}")]
    UnknownPeer(PeerId),

    /// A connection was accepted between two roles that may not be paired.
    #[error("Incompatible roles: local '{local}' cannot connect to remote '{remote}'")]
    IncompatibleRoles {
        /// The role of this process.
        local: ClientRole,
        /// The role the remote peer claims.
        remote: ClientRole,
    },

    /// A command with this name is already registered.
    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    /// The command name is empty or contains characters outside `[A-Za-z0-9._-]`.
    #[error("Invalid command name: '{0}'")]
    InvalidCommandName(String),
}

/// Errors raised synchronously by a transport's `send`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,

    /// The transport exists but is not (yet) connected.
    #[error("Transport not open (state: {0})")]
    NotOpen(String),

    /// The message could not be encoded for this medium.
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// The underlying channel refused the message.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
