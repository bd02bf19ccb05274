//! The capability set every transport implements.

use std::fmt;
use studiolink_types::{ConnectionState, PeerId, TransportResult};
use studiolink_wire::{CorrelationEngine, Envelope};
use tokio::sync::{broadcast, watch};

/// The physical medium behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    LocalBroker,
    PeerToPeer,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::LocalBroker => f.write_str("local-broker"),
            TransportKind::PeerToPeer => f.write_str("peer-to-peer"),
        }
    }
}

/// One communication medium between this process and one remote peer.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// The peer on the other end.
    fn remote_peer(&self) -> &PeerId;

    /// Whether envelopes cross the medium as structured values. Text-only
    /// media encode them and can't carry arbitrary values natively.
    fn supports_structured(&self) -> bool;

    /// Put one envelope on the medium. Fails immediately when the transport
    /// is closed or not yet open.
    fn send(&self, envelope: Envelope) -> TransportResult<()>;

    fn connection_state(&self) -> ConnectionState;

    /// Observe state changes.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Observe inbound envelopes. The engine receives them regardless.
    fn subscribe_messages(&self) -> broadcast::Receiver<Envelope>;

    /// The correlation engine bound to this transport.
    fn engine(&self) -> &CorrelationEngine;

    /// Close the medium. Outstanding calls fail with `Disconnected`.
    fn close(&self);
}

/// Wait until `transport` reaches `target`. Returns `false` if the transport
/// is dropped first.
pub async fn wait_for_state(transport: &dyn Transport, target: ConnectionState) -> bool {
    let mut rx = transport.watch_state();
    let reached = rx.wait_for(|state| *state == target).await.is_ok();
    reached
}
