//! Transport over a port pair handed out by a local broker.
//!
//! Both ends live in processes (or tasks) that trust the same broker, so the
//! channel is usable the moment it exists and envelopes cross it as values.

use crate::lifecycle::TransportCore;
use crate::transport::{Transport, TransportKind};
use std::sync::{Arc, Mutex};
use studiolink_types::{ConnectionState, PeerId, TransportError, TransportResult};
use studiolink_wire::{CorrelationEngine, EngineConfig, Envelope};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// One end of a linked port pair.
#[derive(Debug)]
pub struct LocalPort {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create two ports where whatever one sends, the other receives.
pub fn port_pair() -> (LocalPort, LocalPort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LocalPort { tx: a_tx, rx: a_rx },
        LocalPort { tx: b_tx, rx: b_rx },
    )
}

/// A [`Transport`] over a [`LocalPort`].
///
/// Connected on construction. It becomes disconnected when closed, either
/// explicitly or because the other end of the port went away.
pub struct LocalBrokerTransport {
    core: TransportCore,
    remote: PeerId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBrokerTransport {
    /// Start a transport on `port`. Must be called within a tokio runtime.
    pub fn new(remote: PeerId, port: LocalPort, engine_config: EngineConfig) -> Arc<Self> {
        let LocalPort { tx, mut rx } = port;
        let transport = Arc::new(Self {
            core: TransportCore::new(
                format!("local:{remote}"),
                CorrelationEngine::new(engine_config),
            ),
            remote,
            outbound: Mutex::new(Some(tx)),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&transport);
        transport.core.engine().set_send_hook(move |envelope| match weak.upgrade() {
            Some(t) => t.send(envelope),
            None => Err(TransportError::Closed),
        });

        let weak = Arc::downgrade(&transport);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(t) = weak.upgrade() else {
                    return;
                };
                debug!(transport = %t.core.label(), id = envelope.message.id, "Inbound message");
                t.core.deliver(envelope);
            }
            if let Some(t) = weak.upgrade() {
                debug!(transport = %t.core.label(), "Remote end of port closed");
                t.shutdown();
            }
        });
        *transport.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);

        transport.core.set_state(ConnectionState::Connected);
        transport
    }

    fn shutdown(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.core.set_state(ConnectionState::Disconnected);
    }
}

impl Transport for LocalBrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalBroker
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn supports_structured(&self) -> bool {
        true
    }

    fn send(&self, envelope: Envelope) -> TransportResult<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(envelope)
            .map_err(|_| TransportError::SendFailed("remote port closed".to_string()))
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
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.shutdown();
    }
}

impl Drop for LocalBrokerTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.shutdown();
    }
}
