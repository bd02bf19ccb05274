//! Peer identity, roles and the descriptive records exchanged during discovery.

use crate::error::ProtocolViolation;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a peer, as assigned by a discovery backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of process a peer declares itself to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    /// The editor instance that owns the project.
    Host,
    /// A remote editor instance working on the host's project.
    Client,
    /// A running application being inspected by an editor.
    Inspector,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientRole::Host => "host",
            ClientRole::Client => "client",
            ClientRole::Inspector => "inspector",
        };
        f.write_str(s)
    }
}

/// Whether two roles may be paired in a connection.
///
/// Every legal pairing has exactly one host on one side: clients and
/// inspectors talk to hosts, never to each other, and two hosts never
/// share a project.
pub fn roles_compatible(a: ClientRole, b: ClientRole) -> bool {
    matches!(
        (a, b),
        (ClientRole::Host, ClientRole::Client)
            | (ClientRole::Client, ClientRole::Host)
            | (ClientRole::Host, ClientRole::Inspector)
            | (ClientRole::Inspector, ClientRole::Host)
    )
}

/// Fail with [`ProtocolViolation::IncompatibleRoles`] when `local` and
/// `remote` may not be connected.
pub fn check_role_pair(local: ClientRole, remote: ClientRole) -> Result<(), ProtocolViolation> {
    if roles_compatible(local, remote) {
        Ok(())
    } else {
        Err(ProtocolViolation::IncompatibleRoles { local, remote })
    }
}

/// Human-readable description of the project a peer has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    /// Display name of the project.
    pub name: String,
    /// Whether the peer may write to the project's file system.
    pub file_system_has_write_permissions: bool,
    /// Stable id of the project, independent of the peer.
    pub uuid: Uuid,
}

/// A remote peer that is reachable but not necessarily connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailablePeer {
    pub id: PeerId,
    pub role: ClientRole,
    #[serde(default)]
    pub project_metadata: Option<ProjectMetadata>,
}

impl AvailablePeer {
    /// A peer with no project metadata yet.
    pub fn new(id: impl Into<PeerId>, role: ClientRole) -> Self {
        Self {
            id: id.into(),
            role,
            project_metadata: None,
        }
    }
}

/// Opaque application data attached to a connection request (e.g. an
/// inspector's pairing token).
pub type RequestData = serde_json::Value;

/// Composite state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
