//! Aggregation of every discovery backend a process uses.
//!
//! The registry knows the local role, so it is where role compatibility is
//! enforced: outgoing requests to an incompatible peer fail before any
//! transport exists, and incoming connections from one are closed before
//! the application hears about them. Either way the violation is reported
//! to [`ConnectionRegistry::on_protocol_violation`] listeners.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::listeners::{ListenerId, Listeners};
use crate::method::{DiscoveryKind, DiscoveryMethod};
use crate::state::{
    ActiveConnection, AvailabilityListener, ConnectionRequestListener, ConnectionsChangedListener,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use studiolink_types::{
    check_role_pair, AvailablePeer, ClientRole, PeerId, ProjectMetadata, ProtocolViolation,
    RequestData,
};
use tracing::{error, info, warn};

/// Called with the backend, the remote peer and what it violated.
pub type ViolationListener = dyn Fn(DiscoveryKind, &PeerId, &ProtocolViolation) + Send + Sync;

struct Registered {
    method: Arc<dyn DiscoveryMethod>,
    hooks: Vec<ListenerId>,
}

/// Every discovery method of this process, seen as one.
pub struct ConnectionRegistry {
    local_role: ClientRole,
    me: Weak<ConnectionRegistry>,
    methods: RwLock<BTreeMap<DiscoveryKind, Registered>>,
    request_listeners: Listeners<ConnectionRequestListener>,
    availability_listeners: Listeners<AvailabilityListener>,
    connections_listeners: Listeners<ConnectionsChangedListener>,
    violation_listeners: Listeners<ViolationListener>,
}

impl ConnectionRegistry {
    pub fn new(local_role: ClientRole) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local_role,
            me: me.clone(),
            methods: RwLock::new(BTreeMap::new()),
            request_listeners: Listeners::new(),
            availability_listeners: Listeners::new(),
            connections_listeners: Listeners::new(),
            violation_listeners: Listeners::new(),
        })
    }

    pub fn local_role(&self) -> ClientRole {
        self.local_role
    }

    /// Add a discovery method. A method of the same kind is replaced and
    /// shut down.
    pub async fn add_method(&self, method: Arc<dyn DiscoveryMethod>) {
        let kind = method.kind();
        let hooks = self.hook(&method);
        let previous = self
            .methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, Registered { method, hooks });
        info!(discovery = %kind, "Discovery method added");
        if let Some(previous) = previous {
            self.unhook(&previous);
            previous.method.shutdown().await;
        }
        self.notify_availability();
        self.notify_connections();
    }

    /// Remove and shut down the method of `kind`.
    pub async fn remove_method(&self, kind: DiscoveryKind) -> bool {
        let removed = self
            .methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
        let Some(removed) = removed else {
            return false;
        };
        self.unhook(&removed);
        removed.method.shutdown().await;
        info!(discovery = %kind, "Discovery method removed");
        self.notify_availability();
        self.notify_connections();
        true
    }

    pub fn method(&self, kind: DiscoveryKind) -> Option<Arc<dyn DiscoveryMethod>> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|r| r.method.clone())
    }

    fn methods(&self) -> Vec<Arc<dyn DiscoveryMethod>> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|r| r.method.clone())
            .collect()
    }

    /// Every available peer, tagged with the method that lists it.
    pub fn available_connections(&self) -> Vec<(DiscoveryKind, AvailablePeer)> {
        self.methods()
            .into_iter()
            .flat_map(|m| {
                let kind = m.kind();
                m.available_connections().into_iter().map(move |p| (kind, p))
            })
            .collect()
    }

    /// Available peers whose role can talk to ours.
    pub fn compatible_connections(&self) -> Vec<(DiscoveryKind, AvailablePeer)> {
        self.available_connections()
            .into_iter()
            .filter(|(_, p)| check_role_pair(self.local_role, p.role).is_ok())
            .collect()
    }

    pub fn active_connections(&self) -> Vec<ActiveConnection> {
        self.methods()
            .iter()
            .flat_map(|m| m.active_connections())
            .collect()
    }

    /// Open a connection to `peer_id` through the method of `kind`.
    pub async fn request_connection(
        &self,
        kind: DiscoveryKind,
        peer_id: &PeerId,
        data: RequestData,
    ) -> DiscoveryResult<ActiveConnection> {
        let method = self
            .method(kind)
            .ok_or(DiscoveryError::UnknownMethod(kind))?;
        let Some(peer) = method.core().available(peer_id) else {
            error!(discovery = %kind, peer_id = %peer_id, "Connection requested to an unknown peer");
            let violation = ProtocolViolation::UnknownPeer(peer_id.clone());
            self.report_violation(kind, peer_id, &violation);
            return Err(violation.into());
        };
        if let Err(violation) = check_role_pair(self.local_role, peer.role) {
            error!(
                discovery = %kind,
                peer_id = %peer_id,
                remote_role = %peer.role,
                "Refusing connection between incompatible roles"
            );
            self.report_violation(kind, peer_id, &violation);
            return Err(violation.into());
        }
        let result = method.request_connection(peer_id, data).await;
        if let Err(DiscoveryError::Violation(violation)) = &result {
            self.report_violation(kind, peer_id, violation);
        }
        result
    }

    /// Announce the local role on every method.
    pub async fn register_client(&self) -> DiscoveryResult<()> {
        let mut first_error = None;
        for method in self.methods() {
            if let Err(e) = method.register_client(self.local_role).await {
                warn!(discovery = %method.kind(), error = %e, "Failed to register client");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Publish project metadata on every method. All methods are tried; the
    /// first failure is returned.
    pub async fn set_project_metadata(
        &self,
        metadata: Option<ProjectMetadata>,
    ) -> DiscoveryResult<()> {
        let mut first_error = None;
        for method in self.methods() {
            if let Err(e) = method.set_project_metadata(metadata.clone()).await {
                warn!(discovery = %method.kind(), error = %e, "Failed to publish project metadata");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Check an incoming connection against the local role.
    pub fn accept(&self, connection: &ActiveConnection) -> Result<(), ProtocolViolation> {
        check_role_pair(self.local_role, connection.peer.role)
    }

    /// Called for every connection a method creates. Incompatible incoming
    /// connections are closed; the rest reach the request listeners.
    fn accept_request(&self, connection: &ActiveConnection) {
        if let Err(violation) = self.accept(connection) {
            error!(
                discovery = %connection.discovery,
                peer_id = %connection.peer_id(),
                error = %violation,
                "Closing connection from incompatible peer"
            );
            connection.transport.close();
            self.report_violation(connection.discovery, connection.peer_id(), &violation);
            return;
        }
        for listener in self.request_listeners.snapshot() {
            listener(connection);
        }
    }

    /// Shut down and drop every method.
    pub async fn shutdown(&self) {
        let removed: Vec<Registered> = {
            let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *methods).into_values().collect()
        };
        for registered in removed {
            self.unhook(&registered);
            registered.method.shutdown().await;
        }
        self.notify_availability();
        self.notify_connections();
    }

    // --- listeners ------------------------------------------------------------

    pub fn on_connection_request<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ActiveConnection) + Send + Sync + 'static,
    {
        self.request_listeners.add(Arc::new(listener))
    }

    /// Fired with the aggregated list whenever any method's list changes.
    /// The callback receives peers only; use
    /// [`ConnectionRegistry::available_connections`] for their methods.
    pub fn on_available_connections_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[AvailablePeer]) + Send + Sync + 'static,
    {
        self.availability_listeners.add(Arc::new(listener))
    }

    pub fn on_connections_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[ActiveConnection]) + Send + Sync + 'static,
    {
        self.connections_listeners.add(Arc::new(listener))
    }

    /// Fired for every protocol violation the registry detects: requests
    /// to unlisted or incompatible peers, and incompatible incoming
    /// connections, which are closed before this runs.
    pub fn on_protocol_violation<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(DiscoveryKind, &PeerId, &ProtocolViolation) + Send + Sync + 'static,
    {
        self.violation_listeners.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.request_listeners.remove(id)
            || self.availability_listeners.remove(id)
            || self.connections_listeners.remove(id)
            || self.violation_listeners.remove(id)
    }

    fn report_violation(&self, kind: DiscoveryKind, peer_id: &PeerId, violation: &ProtocolViolation) {
        for listener in self.violation_listeners.snapshot() {
            listener(kind, peer_id, violation);
        }
    }

    fn hook(&self, method: &Arc<dyn DiscoveryMethod>) -> Vec<ListenerId> {
        let core = method.core();
        let me = self.me.clone();
        let on_request = core.on_connection_request(move |connection| {
            if let Some(registry) = me.upgrade() {
                registry.accept_request(connection);
            }
        });
        let me = self.me.clone();
        let on_available = core.on_available_connections_changed(move |_| {
            if let Some(registry) = me.upgrade() {
                registry.notify_availability();
            }
        });
        let me = self.me.clone();
        let on_connections = core.on_connections_changed(move |_| {
            if let Some(registry) = me.upgrade() {
                registry.notify_connections();
            }
        });
        vec![on_request, on_available, on_connections]
    }

    fn unhook(&self, registered: &Registered) {
        let core = registered.method.core();
        for id in &registered.hooks {
            core.remove_listener(*id);
        }
    }

    fn notify_availability(&self) {
        let listeners = self.availability_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let peers: Vec<AvailablePeer> = self
            .available_connections()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        for listener in listeners {
            listener(&peers);
        }
    }

    fn notify_connections(&self) {
        let listeners = self.connections_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let connections = self.active_connections();
        for listener in listeners {
            listener(&connections);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerDiscovery, LocalBroker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use studiolink_types::ConnectionState;
    use studiolink_wire::EngineConfig;

    async fn until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn attach(broker: &LocalBroker, role: ClientRole) -> Arc<ConnectionRegistry> {
        let registry = ConnectionRegistry::new(role);
        let method = BrokerDiscovery::attach(broker, EngineConfig::default())
            .await
            .unwrap();
        registry.add_method(method).await;
        registry.register_client().await.unwrap();
        registry
    }

    fn first_peer(registry: &ConnectionRegistry, role: ClientRole) -> Option<PeerId> {
        registry
            .available_connections()
            .into_iter()
            .find(|(_, p)| p.role == role)
            .map(|(_, p)| p.id)
    }

    #[tokio::test]
    async fn test_aggregates_available_connections_with_kind() {
        let broker = LocalBroker::spawn();
        let host = attach(&broker, ClientRole::Host).await;
        let client = attach(&broker, ClientRole::Client).await;

        until(|| !client.available_connections().is_empty()).await;
        let (kind, peer) = &client.available_connections()[0];
        assert_eq!(*kind, DiscoveryKind::LocalBroker);
        assert_eq!(peer.role, ClientRole::Host);
        until(|| host.available_connections().len() == 1).await;
    }

    #[tokio::test]
    async fn test_request_to_incompatible_role_fails_before_transport() {
        let broker = LocalBroker::spawn();
        let a = attach(&broker, ClientRole::Client).await;
        let _b = attach(&broker, ClientRole::Client).await;

        until(|| first_peer(&a, ClientRole::Client).is_some()).await;
        let peer = first_peer(&a, ClientRole::Client).unwrap();
        assert!(a.compatible_connections().is_empty());

        let err = a
            .request_connection(DiscoveryKind::LocalBroker, &peer, json!(null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Violation(ProtocolViolation::IncompatibleRoles { .. })
        ));
        assert!(a.active_connections().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_and_unknown_peer() {
        let broker = LocalBroker::spawn();
        let registry = attach(&broker, ClientRole::Client).await;

        let err = registry
            .request_connection(DiscoveryKind::Signaling, &PeerId::from("x"), json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownMethod(DiscoveryKind::Signaling)));

        let err = registry
            .request_connection(DiscoveryKind::LocalBroker, &PeerId::from("x"), json!(null))
            .await
            .unwrap_err();
        assert!(err.is_violation());
    }

    #[tokio::test]
    async fn test_incoming_connection_reaches_request_listener() {
        let broker = LocalBroker::spawn();
        let host = attach(&broker, ClientRole::Host).await;
        let client = attach(&broker, ClientRole::Client).await;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let sink = requests.clone();
        host.on_connection_request(move |c| {
            sink.lock().unwrap().push((c.initiated_by_me, c.request_data.clone()));
        });

        until(|| first_peer(&client, ClientRole::Host).is_some()).await;
        let peer = first_peer(&client, ClientRole::Host).unwrap();
        let connection = client
            .request_connection(DiscoveryKind::LocalBroker, &peer, json!({"hello": 1}))
            .await
            .unwrap();
        assert!(connection.initiated_by_me);
        assert_eq!(connection.state(), ConnectionState::Connected);

        until(|| !requests.lock().unwrap().is_empty()).await;
        assert_eq!(
            requests.lock().unwrap()[0],
            (false, json!({"hello": 1}))
        );
        until(|| host.active_connections().len() == 1).await;
    }

    #[tokio::test]
    async fn test_incompatible_incoming_connection_is_closed() {
        let broker = LocalBroker::spawn();
        // Only the requesting side checks roles here: a bare broker method
        // skips the registry on the way out.
        let client_a = attach(&broker, ClientRole::Client).await;
        let raw = BrokerDiscovery::attach(&broker, EngineConfig::default())
            .await
            .unwrap();
        raw.register_client(ClientRole::Client).await.unwrap();

        let heard = Arc::new(AtomicUsize::new(0));
        let counter = heard.clone();
        client_a.on_connection_request(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let violations = Arc::new(Mutex::new(Vec::new()));
        let sink = violations.clone();
        client_a.on_protocol_violation(move |kind, _peer, violation| {
            sink.lock().unwrap().push((kind, violation.clone()));
        });

        until(|| !raw.available_connections().is_empty()).await;
        let target = raw.available_connections()[0].id.clone();
        let connection = raw.request_connection(&target, json!(null)).await.unwrap();

        until(|| connection.transport.connection_state() == ConnectionState::Disconnected).await;
        assert_eq!(heard.load(Ordering::SeqCst), 0);
        until(|| !violations.lock().unwrap().is_empty()).await;
        assert_eq!(
            violations.lock().unwrap()[0],
            (
                DiscoveryKind::LocalBroker,
                ProtocolViolation::IncompatibleRoles {
                    local: ClientRole::Client,
                    remote: ClientRole::Client,
                }
            )
        );
        until(|| client_a.active_connections().is_empty()).await;
    }

    #[tokio::test]
    async fn test_listing_that_changes_before_request_is_refused() {
        let broker = LocalBroker::spawn();
        let client = attach(&broker, ClientRole::Client).await;
        let _host = attach(&broker, ClientRole::Host).await;

        let violations = Arc::new(Mutex::new(Vec::new()));
        let sink = violations.clone();
        client.on_protocol_violation(move |_kind, peer: &PeerId, violation| {
            sink.lock().unwrap().push((peer.clone(), violation.clone()));
        });

        until(|| first_peer(&client, ClientRole::Host).is_some()).await;
        let host_id = first_peer(&client, ClientRole::Host).unwrap();
        assert_eq!(client.compatible_connections().len(), 1);

        // The listing now claims a role we cannot pair with.
        let core = client.method(DiscoveryKind::LocalBroker).unwrap().core().clone();
        core.add_available_connection(&AvailablePeer::new(host_id.clone(), ClientRole::Client));
        let err = client
            .request_connection(DiscoveryKind::LocalBroker, &host_id, json!(null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Violation(ProtocolViolation::IncompatibleRoles { .. })
        ));

        // And then disappears.
        core.remove_available_connection(&host_id);
        let err = client
            .request_connection(DiscoveryKind::LocalBroker, &host_id, json!(null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Violation(ProtocolViolation::UnknownPeer(ref p)) if *p == host_id
        ));

        assert!(client.active_connections().is_empty());
        let violations = violations.lock().unwrap();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|(peer, _)| *peer == host_id));
    }

    #[tokio::test]
    async fn test_metadata_fans_out_and_change_listeners_fire() {
        let broker = LocalBroker::spawn();
        let host = attach(&broker, ClientRole::Host).await;
        let client = attach(&broker, ClientRole::Client).await;

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        client.on_available_connections_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        until(|| first_peer(&client, ClientRole::Host).is_some()).await;
        let before = changes.load(Ordering::SeqCst);
        host.set_project_metadata(Some(ProjectMetadata {
            name: "Demo".to_string(),
            file_system_has_write_permissions: true,
            uuid: uuid::Uuid::new_v4(),
        }))
        .await
        .unwrap();

        until(|| {
            client
                .available_connections()
                .iter()
                .any(|(_, p)| p.project_metadata.is_some())
        })
        .await;
        assert!(changes.load(Ordering::SeqCst) > before);
    }

    #[tokio::test]
    async fn test_remove_method_stops_forwarding() {
        let broker = LocalBroker::spawn();
        let client = attach(&broker, ClientRole::Client).await;
        let _host = attach(&broker, ClientRole::Host).await;
        until(|| !client.available_connections().is_empty()).await;

        assert!(client.remove_method(DiscoveryKind::LocalBroker).await);
        assert!(!client.remove_method(DiscoveryKind::LocalBroker).await);
        assert!(client.available_connections().is_empty());
        assert!(client.method(DiscoveryKind::LocalBroker).is_none());
    }
}
