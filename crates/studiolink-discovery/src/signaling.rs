//! Discovery through a signaling server.
//!
//! One long-lived websocket to the discovery server carries this client's
//! announcements, the server's availability snapshots and updates, and the
//! negotiation signals of every peer-to-peer transport this backend creates.
//! When the socket drops, availability is cleared and the client reconnects
//! with exponential backoff, then announces itself again. Transports that
//! are already connected are left alone.
//!
//! Every offer an initiating side relays carries a random nonce. When two
//! peers request each other at the same time, each receives an offer while
//! its own offer is outstanding; the side whose nonce is lower drops its
//! transport and answers the remote offer instead.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::method::{DiscoveryKind, DiscoveryMethod};
use crate::state::{ActiveConnection, DiscoveryCore};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use studiolink_transport::{
    PeerToPeerTransport, SdpType, SessionFactory, SignalMessage, SignalSink, Transport,
};
use studiolink_types::config::DiscoveryConfig;
use studiolink_types::{
    ClientRole, ConnectionState, PeerId, ProjectMetadata, ProtocolViolation, RequestData,
};
use studiolink_wire::{ClientOp, EngineConfig, ServerOp};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Key carrying the connection request data inside the first offer relayed
/// to a peer.
const REQUEST_DATA_KEY: &str = "requestData";
/// Key carrying the initiating side's nonce inside every relayed offer.
const OFFER_NONCE_KEY: &str = "offerNonce";

/// What this client has announced, replayed after every reconnect.
#[derive(Default)]
struct Announcement {
    role: Option<ClientRole>,
    metadata: Option<ProjectMetadata>,
    connected: bool,
}

struct Shared {
    core: Arc<DiscoveryCore>,
    sessions: Arc<dyn SessionFactory>,
    outbound: mpsc::UnboundedSender<ClientOp>,
    announcement: Mutex<Announcement>,
    connected: watch::Sender<bool>,
    transports: DashMap<PeerId, Tracked>,
}

/// A transport this backend created, plus the nonce of its offers when this
/// side initiated it.
#[derive(Clone)]
struct Tracked {
    transport: Arc<PeerToPeerTransport>,
    nonce: Option<String>,
}

impl Tracked {
    /// Whether an offer carrying `theirs` wins over this side's own offer.
    fn yields_to(&self, theirs: Option<&str>) -> bool {
        match (self.nonce.as_deref(), theirs) {
            (Some(mine), Some(theirs)) => theirs > mine,
            _ => false,
        }
    }
}

/// A [`DiscoveryMethod`] backed by a discovery server.
pub struct SignalingDiscovery {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingDiscovery {
    /// Start connecting to `config.server_url`. Returns immediately; watch
    /// [`SignalingDiscovery::connection_status`] to know when the server is
    /// reachable. Must be called within a tokio runtime.
    pub fn connect(
        config: DiscoveryConfig,
        sessions: Arc<dyn SessionFactory>,
        engine_config: EngineConfig,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            core: DiscoveryCore::new(DiscoveryKind::Signaling, engine_config),
            sessions,
            outbound,
            announcement: Mutex::new(Announcement::default()),
            connected,
            transports: DashMap::new(),
        });

        let task = tokio::spawn(run(shared.clone(), config, outbound_rx, shutdown_rx));
        Self {
            shared,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// `true` while the websocket to the server is up.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }
}

impl Shared {
    fn announcement(&self) -> std::sync::MutexGuard<'_, Announcement> {
        self.announcement.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an op for the server. Fails while disconnected.
    fn send_op(&self, op: ClientOp) -> DiscoveryResult<()> {
        let announcement = self.announcement();
        if !announcement.connected {
            return Err(DiscoveryError::NotConnected);
        }
        self.outbound.send(op).map_err(|_| DiscoveryError::Closed)
    }

    /// Relay signals for `peer_id` through the server. `request_data`, if
    /// any, rides along with the first offer; `nonce` with every offer.
    fn relay_sink(
        self: &Arc<Self>,
        peer_id: PeerId,
        request_data: Option<RequestData>,
        nonce: Option<String>,
    ) -> SignalSink {
        let shared: Weak<Shared> = Arc::downgrade(self);
        let request_data = Mutex::new(request_data);
        Arc::new(move |signal: SignalMessage| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let is_offer = matches!(&signal, SignalMessage::Sdp(d) if d.sdp_type == SdpType::Offer);
            let mut data = signal.to_value();
            if let Some(object) = data.as_object_mut().filter(|_| is_offer) {
                let attached = request_data.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(attached) = attached {
                    object.insert(REQUEST_DATA_KEY.to_string(), attached);
                }
                if let Some(nonce) = &nonce {
                    object.insert(OFFER_NONCE_KEY.to_string(), Value::String(nonce.clone()));
                }
            }
            let op = ClientOp::RelayMessage {
                to_peer_id: peer_id.clone(),
                data,
            };
            if let Err(e) = shared.send_op(op) {
                warn!(peer_id = %peer_id, error = %e, "Failed to relay negotiation signal");
            }
        })
    }

    /// Create a transport to `peer_id` and track it.
    fn open_transport(
        self: &Arc<Self>,
        peer_id: &PeerId,
        initiator: bool,
        request_data: RequestData,
    ) -> DiscoveryResult<ActiveConnection> {
        let relay_data = initiator.then(|| request_data.clone());
        let nonce = initiator.then(|| Uuid::new_v4().simple().to_string());
        let relay = self.relay_sink(peer_id.clone(), relay_data, nonce.clone());
        let session = self.sessions.create_session();
        let config = self.core.engine_config().clone();
        let mut created = None;

        let connection = self
            .core
            .add_active_connection(peer_id, initiator, request_data, |peer| {
                let transport =
                    PeerToPeerTransport::new(peer.id.clone(), initiator, session, relay, config)?;
                created = Some(transport.clone());
                let transport: Arc<dyn Transport> = transport;
                Ok(transport)
            })?;

        if let Some(transport) = created {
            if let Some(previous) = self
                .transports
                .insert(peer_id.clone(), Tracked { transport, nonce })
            {
                previous.transport.close();
            }
        }
        Ok(connection)
    }

    fn live_transport(&self, peer_id: &PeerId) -> Option<Tracked> {
        let tracked = self.transports.get(peer_id).map(|t| t.value().clone())?;
        if tracked.transport.connection_state() == ConnectionState::Disconnected {
            self.transports.remove(peer_id);
            return None;
        }
        Some(tracked)
    }

    fn handle_server_op(self: &Arc<Self>, op: ServerOp) {
        match op {
            ServerOp::SetAvailableConnections { connections } => {
                self.core.set_available_connections(&connections);
            }
            ServerOp::AddAvailableConnection { connection } => {
                self.core.add_available_connection(&connection);
            }
            ServerOp::RemoveAvailableConnection { id } => {
                self.core.remove_available_connection(&id);
            }
            ServerOp::SetConnectionProjectMetadata { id, metadata } => {
                self.core.set_connection_project_metadata(&id, metadata);
            }
            ServerOp::RelayMessage { from_peer_id, data } => self.handle_relay(from_peer_id, data),
        }
    }

    fn handle_relay(self: &Arc<Self>, from: PeerId, mut data: Value) {
        let (request_data, nonce) = match data.as_object_mut() {
            Some(object) => (
                object.remove(REQUEST_DATA_KEY).unwrap_or(Value::Null),
                object
                    .remove(OFFER_NONCE_KEY)
                    .and_then(|v| v.as_str().map(str::to_string)),
            ),
            None => (Value::Null, None),
        };
        let signal = match SignalMessage::from_value(data) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(peer_id = %from, error = %e, "Dropping malformed relay payload");
                return;
            }
        };
        let is_offer = matches!(&signal, SignalMessage::Sdp(d) if d.sdp_type == SdpType::Offer);

        if let Some(tracked) = self.live_transport(&from) {
            if !(is_offer && tracked.yields_to(nonce.as_deref())) {
                tracked.transport.handle_signal(signal);
                return;
            }
            info!(peer_id = %from, "Both sides offered, answering the remote offer");
        }

        if !is_offer {
            debug!(peer_id = %from, "Dropping signal for a peer without a transport");
            return;
        }

        info!(peer_id = %from, "Incoming peer-to-peer connection");
        match self.open_transport(&from, false, request_data) {
            Ok(_) => {
                if let Some(tracked) = self.live_transport(&from) {
                    tracked.transport.handle_signal(signal);
                }
            }
            Err(e) => error!(peer_id = %from, error = %e, "Cannot accept incoming connection"),
        }
    }

    /// Mark the socket up and queue the announcement, atomically with
    /// respect to `register_client` and `set_project_metadata`.
    fn on_connected(&self) {
        let mut announcement = self.announcement();
        announcement.connected = true;
        if let Some(role) = announcement.role {
            let _ = self.outbound.send(ClientOp::RegisterClient { role });
            let _ = self.outbound.send(ClientOp::SetProjectMetadata {
                metadata: announcement.metadata.clone(),
            });
        }
        drop(announcement);
        self.connected.send_replace(true);
    }

    fn on_disconnected(&self, outbound: &mut mpsc::UnboundedReceiver<ClientOp>) {
        self.announcement().connected = false;
        let mut dropped = 0usize;
        while outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded ops queued for the lost connection");
        }
        self.connected.send_replace(false);
        self.core.clear_available_connections();
    }
}

async fn run(
    shared: Arc<Shared>,
    config: DiscoveryConfig,
    mut outbound: mpsc::UnboundedReceiver<ClientOp>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let initial_backoff = config.reconnect_initial();
    let max_backoff = config.reconnect_max();
    let mut backoff = initial_backoff;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        info!(url = %config.server_url, "Connecting to discovery server");
        let ws_stream = match tokio_tungstenite::connect_async(config.server_url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "Discovery server connection failed, retrying in {backoff:?}");
                if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        backoff = initial_backoff;
        info!(url = %config.server_url, "Discovery server connected");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        shared.on_connected();

        let should_reconnect = 'inner: loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(error = %e, "Discovery server websocket error");
                            break 'inner true;
                        }
                        None => {
                            info!("Discovery server closed the connection");
                            break 'inner true;
                        }
                    };
                    let text = match msg {
                        Message::Text(t) => t,
                        Message::Close(_) => {
                            info!("Discovery server sent close");
                            break 'inner true;
                        }
                        _ => continue,
                    };
                    match serde_json::from_str::<ServerOp>(&text) {
                        Ok(op) => shared.handle_server_op(op),
                        Err(e) => warn!(error = %e, "Failed to parse discovery server message"),
                    }
                }
                Some(op) = outbound.recv() => {
                    let text = match serde_json::to_string(&op) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode discovery op");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        warn!(error = %e, "Discovery server send failed");
                        break 'inner true;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws_tx.close().await;
                        break 'inner false;
                    }
                }
            }
        };

        shared.on_disconnected(&mut outbound);
        if !should_reconnect || *shutdown_rx.borrow() {
            break;
        }
        warn!("Discovery server connection lost, reconnecting in {backoff:?}");
        if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
            break;
        }
        backoff = (backoff * 2).min(max_backoff);
    }

    info!("Discovery client loop stopped");
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => true,
    }
}

#[async_trait]
impl DiscoveryMethod for SignalingDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Signaling
    }

    fn core(&self) -> &Arc<DiscoveryCore> {
        &self.shared.core
    }

    async fn register_client(&self, role: ClientRole) -> DiscoveryResult<()> {
        let mut announcement = self.shared.announcement();
        announcement.role = Some(role);
        if announcement.connected {
            self.shared
                .outbound
                .send(ClientOp::RegisterClient { role })
                .map_err(|_| DiscoveryError::Closed)?;
        }
        Ok(())
    }

    async fn set_project_metadata(
        &self,
        metadata: Option<ProjectMetadata>,
    ) -> DiscoveryResult<()> {
        let mut announcement = self.shared.announcement();
        announcement.metadata = metadata.clone();
        if announcement.connected && announcement.role.is_some() {
            self.shared
                .outbound
                .send(ClientOp::SetProjectMetadata { metadata })
                .map_err(|_| DiscoveryError::Closed)?;
        }
        Ok(())
    }

    async fn request_connection(
        &self,
        peer_id: &PeerId,
        data: RequestData,
    ) -> DiscoveryResult<ActiveConnection> {
        if self.shared.core.available(peer_id).is_none() {
            error!(peer_id = %peer_id, "Connection requested to a peer that is not available");
            return Err(ProtocolViolation::UnknownPeer(peer_id.clone()).into());
        }
        if !self.is_connected() {
            return Err(DiscoveryError::NotConnected);
        }
        self.shared.open_transport(peer_id, true, data)
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Discovery client loop did not stop in time");
            }
        }
        self.shared.transports.clear();
        self.shared.core.close_all();
        self.shared.core.clear_available_connections();
    }
}

impl Drop for SignalingDiscovery {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
