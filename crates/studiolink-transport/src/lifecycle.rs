//! State, inbound fan-out and engine shared by every transport.

use studiolink_types::ConnectionState;
use studiolink_wire::{CorrelationEngine, Envelope};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Capacity of the inbound message tap. Slow subscribers lag, the engine
/// never does.
const MESSAGE_TAP_CAPACITY: usize = 256;

/// The parts of a transport that don't depend on the medium.
pub struct TransportCore {
    label: String,
    state: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<Envelope>,
    engine: CorrelationEngine,
}

impl TransportCore {
    /// `label` identifies the transport in logs, e.g. `p2p:<peer id>`.
    pub fn new(label: impl Into<String>, engine: CorrelationEngine) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_TAP_CAPACITY);
        Self {
            label: label.into(),
            state,
            messages,
            engine,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`. Returns whether the state changed.
    ///
    /// Entering [`ConnectionState::Disconnected`] rejects every outstanding
    /// call on the engine.
    pub fn set_state(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            info!(
                transport = %self.label,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
            if next == ConnectionState::Disconnected {
                let rejected = self.engine.reject_all();
                if rejected > 0 {
                    debug!(transport = %self.label, rejected, "Rejected pending calls");
                }
            }
        }
        changed
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.messages.subscribe()
    }

    /// Hand an inbound envelope to message subscribers and the engine.
    pub fn deliver(&self, envelope: Envelope) {
        if self.messages.receiver_count() > 0 {
            let _ = self.messages.send(envelope.clone());
        }
        self.engine.handle_received(envelope);
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }
}

impl std::fmt::Debug for TransportCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCore")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
