//! Availability and active-connection state of one discovery backend.
//!
//! Only the owning backend mutates a [`DiscoveryCore`]. Readers get clones;
//! nothing handed out changes behind the caller's back.

use crate::error::DiscoveryResult;
use crate::listeners::{ListenerId, Listeners};
use crate::method::DiscoveryKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use studiolink_transport::Transport;
use studiolink_types::{
    AvailablePeer, ConnectionState, PeerId, ProjectMetadata, ProtocolViolation, RequestData,
    TransportError,
};
use studiolink_wire::EngineConfig;
use tracing::{debug, error, info};
use uuid::Uuid;

pub type AvailabilityListener = dyn Fn(&[AvailablePeer]) + Send + Sync;
pub type ConnectionRequestListener = dyn Fn(&ActiveConnection) + Send + Sync;
pub type ConnectionsChangedListener = dyn Fn(&[ActiveConnection]) + Send + Sync;

/// A transport to a remote peer, as tracked by the backend that created it.
#[derive(Clone)]
pub struct ActiveConnection {
    /// Unique per connection, even across reconnects to the same peer.
    pub connection_id: Uuid,
    /// The peer as listed when the connection was created.
    pub peer: AvailablePeer,
    /// True when this process requested the connection.
    pub initiated_by_me: bool,
    pub request_data: RequestData,
    pub transport: Arc<dyn Transport>,
    pub discovery: DiscoveryKind,
    pub connected_at: DateTime<Utc>,
}

impl ActiveConnection {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.connection_state()
    }
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("initiated_by_me", &self.initiated_by_me)
            .field("discovery", &self.discovery)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared bookkeeping for a [`crate::DiscoveryMethod`].
pub struct DiscoveryCore {
    kind: DiscoveryKind,
    engine_config: EngineConfig,
    me: Weak<DiscoveryCore>,
    available: RwLock<Vec<AvailablePeer>>,
    active: RwLock<HashMap<PeerId, ActiveConnection>>,
    availability_listeners: Listeners<AvailabilityListener>,
    request_listeners: Listeners<ConnectionRequestListener>,
    connections_listeners: Listeners<ConnectionsChangedListener>,
}

impl DiscoveryCore {
    pub fn new(kind: DiscoveryKind, engine_config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            kind,
            engine_config,
            me: me.clone(),
            available: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            availability_listeners: Listeners::new(),
            request_listeners: Listeners::new(),
            connections_listeners: Listeners::new(),
        })
    }

    pub fn kind(&self) -> DiscoveryKind {
        self.kind
    }

    /// Engine settings for transports minted by this backend.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    // --- availability -------------------------------------------------------

    pub fn available_connections(&self) -> Vec<AvailablePeer> {
        self.available
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn available(&self, peer_id: &PeerId) -> Option<AvailablePeer> {
        self.available
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| &p.id == peer_id)
            .cloned()
    }

    /// Add `peer`, or replace the entry with the same id. No notification
    /// when nothing changes.
    pub fn add_available_connection(&self, peer: &AvailablePeer) {
        let changed = {
            let mut available = self.available.write().unwrap_or_else(|e| e.into_inner());
            match available.iter_mut().find(|p| p.id == peer.id) {
                Some(existing) if existing == peer => false,
                Some(existing) => {
                    *existing = peer.clone();
                    true
                }
                None => {
                    available.push(peer.clone());
                    true
                }
            }
        };
        if changed {
            debug!(discovery = %self.kind, peer_id = %peer.id, "Peer available");
            self.notify_availability();
        }
    }

    /// Replace the whole list. Later duplicates of an id win. No
    /// notification when the list is unchanged, in particular when an empty
    /// list meets an empty list.
    pub fn set_available_connections(&self, peers: &[AvailablePeer]) {
        let mut next: Vec<AvailablePeer> = Vec::with_capacity(peers.len());
        for peer in peers {
            match next.iter_mut().find(|p| p.id == peer.id) {
                Some(existing) => *existing = peer.clone(),
                None => next.push(peer.clone()),
            }
        }
        let changed = {
            let mut available = self.available.write().unwrap_or_else(|e| e.into_inner());
            if *available == next {
                false
            } else {
                *available = next;
                true
            }
        };
        if changed {
            debug!(discovery = %self.kind, count = peers.len(), "Availability replaced");
            self.notify_availability();
        }
    }

    /// Returns whether the peer was listed.
    pub fn remove_available_connection(&self, peer_id: &PeerId) -> bool {
        let removed = {
            let mut available = self.available.write().unwrap_or_else(|e| e.into_inner());
            let before = available.len();
            available.retain(|p| &p.id != peer_id);
            available.len() != before
        };
        if removed {
            debug!(discovery = %self.kind, peer_id = %peer_id, "Peer no longer available");
            self.notify_availability();
        }
        removed
    }

    pub fn clear_available_connections(&self) {
        let cleared = {
            let mut available = self.available.write().unwrap_or_else(|e| e.into_inner());
            let had_any = !available.is_empty();
            available.clear();
            had_any
        };
        if cleared {
            debug!(discovery = %self.kind, "Availability cleared");
            self.notify_availability();
        }
    }

    /// Update one peer's project metadata. Unknown ids are ignored.
    pub fn set_connection_project_metadata(
        &self,
        peer_id: &PeerId,
        metadata: Option<ProjectMetadata>,
    ) {
        let changed = {
            let mut available = self.available.write().unwrap_or_else(|e| e.into_inner());
            match available.iter_mut().find(|p| &p.id == peer_id) {
                Some(peer) if peer.project_metadata != metadata => {
                    peer.project_metadata = metadata;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify_availability();
        }
    }

    // --- active connections ---------------------------------------------------

    /// Create, track and announce a transport to `peer_id`.
    ///
    /// `make_transport` is only called for listed peers; asking for an
    /// unlisted one is a [`ProtocolViolation::UnknownPeer`]. A connection
    /// already tracked for the same peer is closed and replaced. Connection
    /// request listeners run before this returns, so they can close the
    /// transport to reject it.
    pub fn add_active_connection<F>(
        &self,
        peer_id: &PeerId,
        initiated_by_me: bool,
        request_data: RequestData,
        make_transport: F,
    ) -> DiscoveryResult<ActiveConnection>
    where
        F: FnOnce(&AvailablePeer) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let Some(peer) = self.available(peer_id) else {
            error!(
                discovery = %self.kind,
                peer_id = %peer_id,
                "Refusing to create a connection to a peer that is not available"
            );
            return Err(ProtocolViolation::UnknownPeer(peer_id.clone()).into());
        };

        let transport = make_transport(&peer)?;
        let connection = ActiveConnection {
            connection_id: Uuid::new_v4(),
            peer,
            initiated_by_me,
            request_data,
            transport,
            discovery: self.kind,
            connected_at: Utc::now(),
        };

        let replaced = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.clone(), connection.clone());
        if let Some(replaced) = replaced {
            debug!(discovery = %self.kind, peer_id = %peer_id, "Replacing existing connection");
            replaced.transport.close();
        }
        info!(
            discovery = %self.kind,
            peer_id = %peer_id,
            initiated_by_me,
            "Connection created"
        );

        self.watch_connection(&connection);
        for listener in self.request_listeners.snapshot() {
            listener(&connection);
        }
        self.notify_connections();
        Ok(connection)
    }

    pub fn active_connection(&self, peer_id: &PeerId) -> Option<ActiveConnection> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    pub fn active_connections(&self) -> Vec<ActiveConnection> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Close every tracked transport and forget them.
    pub fn close_all(&self) {
        let connections: Vec<ActiveConnection> = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        if connections.is_empty() {
            return;
        }
        for connection in &connections {
            connection.transport.close();
        }
        self.notify_connections();
    }

    /// Forget the connection once its transport disconnects.
    fn watch_connection(&self, connection: &ActiveConnection) {
        let mut state = connection.transport.watch_state();
        let core = self.me.clone();
        let peer_id = connection.peer.id.clone();
        let connection_id = connection.connection_id;
        tokio::spawn(async move {
            let _ = state
                .wait_for(|s| *s == ConnectionState::Disconnected)
                .await;
            if let Some(core) = core.upgrade() {
                core.forget_connection(&peer_id, connection_id);
            }
        });
    }

    fn forget_connection(&self, peer_id: &PeerId, connection_id: Uuid) {
        let removed = {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            match active.get(peer_id) {
                Some(c) if c.connection_id == connection_id => active.remove(peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(discovery = %self.kind, peer_id = %peer_id, "Connection closed");
            self.notify_connections();
        }
    }

    // --- listeners ------------------------------------------------------------

    pub fn on_available_connections_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[AvailablePeer]) + Send + Sync + 'static,
    {
        self.availability_listeners.add(Arc::new(listener))
    }

    pub fn on_connection_request<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ActiveConnection) + Send + Sync + 'static,
    {
        self.request_listeners.add(Arc::new(listener))
    }

    pub fn on_connections_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[ActiveConnection]) + Send + Sync + 'static,
    {
        self.connections_listeners.add(Arc::new(listener))
    }

    /// Remove a listener added through any of the `on_*` methods.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.availability_listeners.remove(id)
            || self.request_listeners.remove(id)
            || self.connections_listeners.remove(id)
    }

    fn notify_availability(&self) {
        let listeners = self.availability_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.available_connections();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn notify_connections(&self) {
        let listeners = self.connections_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.active_connections();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use studiolink_transport::{port_pair, LocalBrokerTransport, LocalPort};
    use studiolink_types::ClientRole;

    fn core() -> Arc<DiscoveryCore> {
        DiscoveryCore::new(DiscoveryKind::LocalBroker, EngineConfig::default())
    }

    fn count_availability(core: &DiscoveryCore) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        core.on_available_connections_changed(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn local_transport(peer: &AvailablePeer, port: LocalPort) -> Arc<dyn Transport> {
        LocalBrokerTransport::new(peer.id.clone(), port, EngineConfig::default())
    }

    #[test]
    fn test_add_then_remove_fires_twice() {
        let core = core();
        let fired = count_availability(&core);

        core.add_available_connection(&AvailablePeer::new("p1", ClientRole::Host));
        assert!(core.remove_available_connection(&PeerId::from("p1")));

        assert!(core.available_connections().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_empty_on_empty_is_silent() {
        let core = core();
        let fired = count_availability(&core);

        core.set_available_connections(&[]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        core.set_available_connections(&[AvailablePeer::new("p1", ClientRole::Client)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Resending the same snapshot is silent as well.
        core.set_available_connections(&[AvailablePeer::new("p1", ClientRole::Client)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idempotent_primitives() {
        let core = core();
        let fired = count_availability(&core);
        let peer = AvailablePeer::new("p1", ClientRole::Host);

        core.add_available_connection(&peer);
        core.add_available_connection(&peer);
        assert!(!core.remove_available_connection(&PeerId::from("nope")));
        core.clear_available_connections();
        core.clear_available_connections();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stored_peer_is_a_copy() {
        let core = core();
        let mut peer = AvailablePeer::new("p1", ClientRole::Host);
        core.add_available_connection(&peer);

        peer.role = ClientRole::Inspector;
        peer.id = PeerId::from("changed");

        let stored = core.available(&PeerId::from("p1")).unwrap();
        assert_eq!(stored.role, ClientRole::Host);

        let mut listed = core.available_connections();
        listed[0].role = ClientRole::Client;
        assert_eq!(core.available_connections()[0].role, ClientRole::Host);
    }

    #[test]
    fn test_project_metadata_update() {
        let core = core();
        core.add_available_connection(&AvailablePeer::new("p1", ClientRole::Host));
        let fired = count_availability(&core);

        let metadata = ProjectMetadata {
            name: "Forest".to_string(),
            file_system_has_write_permissions: true,
            uuid: Uuid::new_v4(),
        };
        core.set_connection_project_metadata(&PeerId::from("p1"), Some(metadata.clone()));
        core.set_connection_project_metadata(&PeerId::from("ghost"), Some(metadata.clone()));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            core.available(&PeerId::from("p1")).unwrap().project_metadata,
            Some(metadata)
        );
    }

    #[tokio::test]
    async fn test_active_connection_requires_available_peer() {
        let core = core();
        let mut factory_called = false;
        let err = core
            .add_active_connection(&PeerId::from("ghost"), true, RequestData::Null, |_| {
                factory_called = true;
                Err(TransportError::Closed)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Violation(ProtocolViolation::UnknownPeer(_))
        ));
        assert!(!factory_called);
        assert!(core.active_connections().is_empty());
    }

    #[tokio::test]
    async fn test_request_listeners_run_synchronously() {
        let core = core();
        core.add_available_connection(&AvailablePeer::new("p1", ClientRole::Host));
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        core.on_connection_request(move |conn| {
            assert_eq!(conn.peer_id().as_str(), "p1");
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let (port, _other) = port_pair();
        let connection = core
            .add_active_connection(&PeerId::from("p1"), false, RequestData::Null, |peer| {
                Ok(local_transport(peer, port))
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!connection.initiated_by_me);
        assert_eq!(core.active_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_connection_is_forgotten() {
        let core = core();
        core.add_available_connection(&AvailablePeer::new("p1", ClientRole::Host));
        core.on_connection_request(|conn| conn.transport.close());
        let (changed_tx, mut changed_rx) = tokio::sync::mpsc::unbounded_channel();
        core.on_connections_changed(move |conns| {
            let _ = changed_tx.send(conns.len());
        });

        let (port, _other) = port_pair();
        core.add_active_connection(&PeerId::from("p1"), false, RequestData::Null, |peer| {
            Ok(local_transport(peer, port))
        })
        .unwrap();

        assert_eq!(changed_rx.recv().await, Some(1));
        assert_eq!(changed_rx.recv().await, Some(0));
        assert!(core.active_connection(&PeerId::from("p1")).is_none());
    }
}
