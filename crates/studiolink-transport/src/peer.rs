//! Peer-to-peer transport over a negotiated session.
//!
//! Each transport runs one driver task that owns the [`Negotiator`] and
//! reacts to three event sources: signals relayed from the remote peer,
//! session events and data channel events. The composite state is
//! `connecting` from construction until the session is connected and both
//! the reliable and the unreliable channel are open. Losing a channel drops
//! back to `connecting`; a failed or closed session ends in `disconnected`.

use crate::lifecycle::TransportCore;
use crate::negotiation::{Negotiator, SignalMessage};
use crate::session::{
    ChannelEvent, ChannelFrame, ChannelReliability, DataChannel, PeerSession, SessionEvent,
    SessionState,
};
use crate::transport::{Transport, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use studiolink_types::{ConnectionState, PeerId, TransportError, TransportResult};
use studiolink_wire::{decode_text, encode_text, CorrelationEngine, EngineConfig, Envelope};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Label of the ordered, retransmitted channel that carries calls.
pub const RELIABLE_CHANNEL: &str = "reliable";
/// Label of the unordered, lossy channel.
pub const UNRELIABLE_CHANNEL: &str = "unreliable";

const REQUIRED_CHANNELS: [&str; 2] = [RELIABLE_CHANNEL, UNRELIABLE_CHANNEL];

/// Where outgoing negotiation signals go, usually a discovery backend's relay.
pub type SignalSink = Arc<dyn Fn(SignalMessage) + Send + Sync>;

/// A [`Transport`] over a [`PeerSession`].
pub struct PeerToPeerTransport {
    core: TransportCore,
    remote: PeerId,
    initiator: bool,
    session: Arc<dyn PeerSession>,
    channels: Mutex<HashMap<String, Arc<dyn DataChannel>>>,
    session_connected: AtomicBool,
    closed: AtomicBool,
    signals: mpsc::UnboundedSender<SignalMessage>,
    channel_events: mpsc::UnboundedSender<(String, ChannelEvent)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerToPeerTransport {
    /// Start a transport to `remote` on `session`.
    ///
    /// The initiator creates both channels and sends the first offer; the
    /// other side waits for it. Must be called within a tokio runtime.
    pub fn new(
        remote: PeerId,
        initiator: bool,
        session: Arc<dyn PeerSession>,
        relay: SignalSink,
        engine_config: EngineConfig,
    ) -> TransportResult<Arc<Self>> {
        let session_events = session.take_events().ok_or_else(|| {
            TransportError::NotOpen("session is already driven by another transport".to_string())
        })?;
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (channel_events, channel_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            core: TransportCore::new(
                format!("p2p:{remote}"),
                CorrelationEngine::new(engine_config),
            ),
            remote,
            initiator,
            session: session.clone(),
            channels: Mutex::new(HashMap::new()),
            session_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            signals,
            channel_events,
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&transport);
        transport.core.engine().set_send_hook(move |envelope| match weak.upgrade() {
            Some(t) => t.send(envelope),
            None => Err(TransportError::Closed),
        });

        transport.core.set_state(ConnectionState::Connecting);
        info!(
            peer_id = %transport.remote,
            initiator,
            "Starting peer-to-peer transport"
        );

        let driver = tokio::spawn(drive(
            Arc::downgrade(&transport),
            Negotiator::new(initiator, session),
            relay,
            signal_rx,
            session_events,
            channel_rx,
        ));
        transport.track(driver);
        Ok(transport)
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Feed a negotiation signal relayed from the remote peer.
    pub fn handle_signal(&self, signal: SignalMessage) {
        if self.signals.send(signal).is_err() {
            debug!(peer_id = %self.remote, "Dropping signal for stopped transport");
        }
    }

    /// Send an envelope on the lossy channel. Delivery is not guaranteed.
    pub fn send_unreliable(&self, envelope: Envelope) -> TransportResult<()> {
        self.send_on(UNRELIABLE_CHANNEL, &envelope)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    fn channel(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(label)
            .cloned()
    }

    fn send_on(&self, label: &str, envelope: &Envelope) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = self
            .channel(label)
            .filter(|c| c.is_open())
            .ok_or_else(|| TransportError::NotOpen(self.core.state().to_string()))?;
        let text = encode_text(envelope).map_err(|e| TransportError::Encoding(e.to_string()))?;
        channel.send(ChannelFrame::Text(text))
    }

    /// Track a channel and forward its events to the driver.
    fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_string();
        if !REQUIRED_CHANNELS.contains(&label.as_str()) {
            debug!(peer_id = %self.remote, label = %label, "Ignoring unexpected data channel");
            return;
        }
        if let Some(mut events) = channel.take_events() {
            let forward = self.channel_events.clone();
            let forward_label = label.clone();
            self.track(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if forward.send((forward_label.clone(), event)).is_err() {
                        break;
                    }
                }
            }));
        }
        let previous = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(label.clone(), channel);
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(peer_id = %self.remote, label = %label, "Data channel attached");
        self.refresh_state();
    }

    fn on_channel_event(&self, label: &str, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                debug!(peer_id = %self.remote, label, "Data channel open");
                self.refresh_state();
            }
            ChannelEvent::Close => {
                debug!(peer_id = %self.remote, label, "Data channel closed");
                self.refresh_state();
            }
            ChannelEvent::Message(frame) => {
                let decoded = match frame {
                    ChannelFrame::Text(text) => decode_text(&text),
                    ChannelFrame::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => decode_text(text),
                        Err(e) => {
                            warn!(peer_id = %self.remote, label, error = %e, "Dropping non-UTF-8 frame");
                            return;
                        }
                    },
                };
                match decoded {
                    Ok(envelope) => self.core.deliver(envelope),
                    Err(e) => {
                        warn!(peer_id = %self.remote, label, error = %e, "Dropping malformed frame");
                    }
                }
            }
        }
    }

    fn on_session_state(&self, state: SessionState) {
        debug!(peer_id = %self.remote, ?state, "Session state changed");
        if state.is_terminal() {
            self.shutdown();
            return;
        }
        self.session_connected
            .store(state == SessionState::Connected, Ordering::SeqCst);
        self.refresh_state();
    }

    /// Recompute the composite state from the session and channel states.
    fn refresh_state(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let channels_open = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            REQUIRED_CHANNELS
                .iter()
                .all(|label| channels.get(*label).is_some_and(|c| c.is_open()))
        };
        let next = if self.session_connected.load(Ordering::SeqCst) && channels_open {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        };
        self.core.set_state(next);
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<_> = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for channel in channels {
            channel.close();
        }
        self.session.close();
        self.core.set_state(ConnectionState::Disconnected);
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        info!(peer_id = %self.remote, "Peer-to-peer transport closed");
    }
}

async fn create_channels(transport: &PeerToPeerTransport) {
    for (label, reliability) in [
        (RELIABLE_CHANNEL, ChannelReliability::Reliable),
        (UNRELIABLE_CHANNEL, ChannelReliability::Unreliable),
    ] {
        match transport.session.create_data_channel(label, reliability).await {
            Ok(channel) => transport.attach_channel(channel),
            Err(e) => warn!(peer_id = %transport.remote, label, error = %e, "Failed to create data channel"),
        }
    }
}

fn relay_offer(
    transport: &PeerToPeerTransport,
    relay: &SignalSink,
    outcome: Result<Option<SignalMessage>, crate::session::NegotiationError>,
) {
    match outcome {
        Ok(Some(signal)) => relay(signal),
        Ok(None) => {}
        Err(e) => warn!(peer_id = %transport.remote, error = %e, "Negotiation step failed"),
    }
}

async fn drive(
    transport: Weak<PeerToPeerTransport>,
    mut negotiator: Negotiator,
    relay: SignalSink,
    mut signals: mpsc::UnboundedReceiver<SignalMessage>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    mut channel_events: mpsc::UnboundedReceiver<(String, ChannelEvent)>,
) {
    if negotiator.is_initiator() {
        let Some(t) = transport.upgrade() else {
            return;
        };
        create_channels(&t).await;
        let outcome = negotiator.offer().await;
        relay_offer(&t, &relay, outcome);
    }

    loop {
        tokio::select! {
            Some(signal) = signals.recv() => {
                let Some(t) = transport.upgrade() else { break };
                let outcome = negotiator.handle(signal).await;
                relay_offer(&t, &relay, outcome);
            }
            Some(event) = session_events.recv() => {
                let Some(t) = transport.upgrade() else { break };
                match event {
                    SessionEvent::IceCandidate(candidate) => {
                        relay(SignalMessage::IceCandidate(candidate));
                    }
                    SessionEvent::NegotiationNeeded => {
                        if negotiator.is_initiator() {
                            debug!(peer_id = %t.remote, "Renegotiating");
                            let outcome = negotiator.offer().await;
                            relay_offer(&t, &relay, outcome);
                        }
                    }
                    SessionEvent::StateChanged(state) => {
                        t.on_session_state(state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                    SessionEvent::DataChannel(channel) => t.attach_channel(channel),
                }
            }
            Some((label, event)) = channel_events.recv() => {
                let Some(t) = transport.upgrade() else { break };
                t.on_channel_event(&label, event);
            }
            else => break,
        }
    }
    debug!("Peer-to-peer driver stopped");
}

impl Transport for PeerToPeerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PeerToPeer
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn supports_structured(&self) -> bool {
        false
    }

    fn send(&self, envelope: Envelope) -> TransportResult<()> {
        self.send_on(RELIABLE_CHANNEL, &envelope)
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.watch_state()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.core.subscribe_messages()
    }

    fn engine(&self) -> &CorrelationEngine {
        self.core.engine()
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl Drop for PeerToPeerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemorySession};
    use crate::transport::wait_for_state;
    use serde_json::json;
    use std::time::Duration;
    use studiolink_wire::{HandlerReply, Request, RpcError};

    /// Two transports whose signals are relayed straight to each other.
    fn pair(
        network: &MemoryNetwork,
    ) -> (
        Arc<PeerToPeerTransport>,
        Arc<MemorySession>,
        Arc<PeerToPeerTransport>,
        Arc<MemorySession>,
    ) {
        let (to_b, mut b_inbox) = mpsc::unbounded_channel::<SignalMessage>();
        let (to_a, mut a_inbox) = mpsc::unbounded_channel::<SignalMessage>();
        let a_session = network.session();
        let b_session = network.session();

        let a = PeerToPeerTransport::new(
            PeerId::from("b"),
            true,
            a_session.clone(),
            Arc::new(move |s| {
                let _ = to_b.send(s);
            }),
            EngineConfig::default(),
        )
        .unwrap();
        let b = PeerToPeerTransport::new(
            PeerId::from("a"),
            false,
            b_session.clone(),
            Arc::new(move |s| {
                let _ = to_a.send(s);
            }),
            EngineConfig::default(),
        )
        .unwrap();

        let weak_b = Arc::downgrade(&b);
        tokio::spawn(async move {
            while let Some(signal) = b_inbox.recv().await {
                match weak_b.upgrade() {
                    Some(b) => b.handle_signal(signal),
                    None => break,
                }
            }
        });
        let weak_a = Arc::downgrade(&a);
        tokio::spawn(async move {
            while let Some(signal) = a_inbox.recv().await {
                match weak_a.upgrade() {
                    Some(a) => a.handle_signal(signal),
                    None => break,
                }
            }
        });

        (a, a_session, b, b_session)
    }

    async fn connected(t: &PeerToPeerTransport) {
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(t, ConnectionState::Connected),
        )
        .await
        .expect("transport did not connect");
    }

    #[tokio::test]
    async fn test_negotiation_reaches_connected_on_both_sides() {
        let network = MemoryNetwork::new();
        let (a, _, b, _) = pair(&network);
        assert!(a.is_initiator());
        assert!(!b.is_initiator());

        connected(&a).await;
        connected(&b).await;
        assert!(!a.supports_structured());
    }

    #[tokio::test]
    async fn test_calls_cross_the_reliable_channel() {
        let network = MemoryNetwork::new();
        let (a, _, b, _) = pair(&network);
        connected(&a).await;
        connected(&b).await;

        b.engine().register("scene.nodeCount", |req: Request| async move {
            let scene = req.args[0]["scene"].as_str().unwrap_or_default().to_string();
            Ok(HandlerReply::value(json!({"scene": scene, "count": 12})))
        });
        let reply = a
            .engine()
            .call("scene.nodeCount", vec![json!({"scene": "main"})])
            .await
            .unwrap();
        assert_eq!(reply, json!({"scene": "main", "count": 12}));
    }

    #[tokio::test]
    async fn test_send_before_open_fails_synchronously() {
        let network = MemoryNetwork::new();
        let session = network.session();
        let t = PeerToPeerTransport::new(
            PeerId::from("nobody"),
            false,
            session,
            Arc::new(|_: SignalMessage| {}),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(t.connection_state(), ConnectionState::Connecting);

        let err = t.engine().call("x", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(TransportError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_session_can_only_drive_one_transport() {
        let network = MemoryNetwork::new();
        let session = network.session();
        let _first = PeerToPeerTransport::new(
            PeerId::from("x"),
            false,
            session.clone(),
            Arc::new(|_: SignalMessage| {}),
            EngineConfig::default(),
        )
        .unwrap();
        let second = PeerToPeerTransport::new(
            PeerId::from("x"),
            false,
            session,
            Arc::new(|_: SignalMessage| {}),
            EngineConfig::default(),
        );
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_losing_one_channel_reverts_to_connecting() {
        let network = MemoryNetwork::new();
        let (a, a_session, b, _) = pair(&network);
        connected(&a).await;
        connected(&b).await;

        a_session.channel(UNRELIABLE_CHANNEL).unwrap().close();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(a.as_ref(), ConnectionState::Connecting),
        )
        .await
        .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(b.as_ref(), ConnectionState::Connecting),
        )
        .await
        .unwrap();

        // The reliable channel still carries calls.
        let reply = a.engine().call("missing", vec![]).await.unwrap();
        assert!(reply.is_null());
    }

    #[tokio::test]
    async fn test_session_failure_disconnects_and_rejects_calls() {
        let network = MemoryNetwork::new();
        let (a, a_session, b, _) = pair(&network);
        connected(&a).await;
        connected(&b).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let held = gate.clone();
        b.engine().register("hold", move |_req: Request| {
            let held = held.clone();
            async move {
                held.notified().await;
                Ok(HandlerReply::value(true))
            }
        });
        let engine = a.engine().clone();
        let call = tokio::spawn(async move { engine.call("hold", vec![]).await });
        while a.engine().pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        a_session.fail();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected)));
        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(b.as_ref(), ConnectionState::Disconnected),
        )
        .await
        .unwrap();
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_dropping_transport_rejects_calls_on_surviving_engine() {
        let network = MemoryNetwork::new();
        let (a, _, b, _) = pair(&network);
        connected(&a).await;
        connected(&b).await;

        b.engine().register("hold", |_req: Request| async move {
            std::future::pending::<()>().await;
            Ok(HandlerReply::value(()))
        });
        let engine = a.engine().clone();
        let call = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call("hold", vec![]).await }
        });
        while engine.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        drop(a);
        assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected)));
        assert_eq!(engine.pending_count(), 0);
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(b.as_ref(), ConnectionState::Disconnected),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = MemoryNetwork::new();
        let (a, _, b, _) = pair(&network);
        connected(&a).await;
        a.close();
        a.close();
        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            a.send(Envelope::new(studiolink_wire::WireMessage::request(1, "x", vec![]))),
            Err(TransportError::Closed)
        ));
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(b.as_ref(), ConnectionState::Disconnected),
        )
        .await
        .unwrap();
    }
}
