//! The discovery backend abstraction.

use crate::error::DiscoveryResult;
use crate::state::{ActiveConnection, DiscoveryCore};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use studiolink_types::{AvailablePeer, ClientRole, PeerId, ProjectMetadata, RequestData};

/// Which backend a method talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiscoveryKind {
    /// A broker shared by peers in the same process group.
    LocalBroker,
    /// A discovery server reached over a websocket.
    Signaling,
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryKind::LocalBroker => f.write_str("local-broker"),
            DiscoveryKind::Signaling => f.write_str("signaling"),
        }
    }
}

/// One discovery backend.
///
/// Implementations keep their availability list and active connections in
/// a [`DiscoveryCore`] and mint every transport through
/// [`DiscoveryCore::add_active_connection`].
#[async_trait]
pub trait DiscoveryMethod: Send + Sync {
    fn kind(&self) -> DiscoveryKind;

    fn core(&self) -> &Arc<DiscoveryCore>;

    /// Announce this process and its role to the backend.
    async fn register_client(&self, _role: ClientRole) -> DiscoveryResult<()> {
        Ok(())
    }

    /// Publish, or clear with `None`, the project this process has open.
    async fn set_project_metadata(
        &self,
        metadata: Option<ProjectMetadata>,
    ) -> DiscoveryResult<()>;

    /// Reach `peer_id` through the backend and open a transport to it.
    ///
    /// Fails with [`studiolink_types::ProtocolViolation::UnknownPeer`] if the
    /// peer is not listed as available.
    async fn request_connection(
        &self,
        peer_id: &PeerId,
        data: RequestData,
    ) -> DiscoveryResult<ActiveConnection>;

    /// Disconnect from the backend and close every transport.
    async fn shutdown(&self);

    fn available_connections(&self) -> Vec<AvailablePeer> {
        self.core().available_connections()
    }

    fn active_connections(&self) -> Vec<ActiveConnection> {
        self.core().active_connections()
    }
}
