//! Discovery errors.

use crate::method::DiscoveryKind;
use studiolink_types::{ProtocolViolation, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A registry or discovery bug, such as connecting to an unlisted peer.
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The backend's signaling connection is down.
    #[error("Not connected to the discovery backend")]
    NotConnected,

    /// The backend has been shut down.
    #[error("Discovery backend shut down")]
    Closed,

    /// The backend refused the request.
    #[error("Connection request rejected: {0}")]
    Rejected(String),

    #[error("No discovery method of kind '{0}' is registered")]
    UnknownMethod(DiscoveryKind),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

impl DiscoveryError {
    pub fn is_violation(&self) -> bool {
        matches!(self, DiscoveryError::Violation(_))
    }
}
