//! Studiolink transports.
//!
//! A transport is one physical medium between two peers. Every transport
//! exposes the same small surface ([`Transport`]): send an envelope, observe
//! inbound envelopes and the composite [`ConnectionState`], and close. Each
//! one owns the [`CorrelationEngine`] that turns it into a call interface.
//!
//! - [`LocalBrokerTransport`]: a port pair handed out by a broker both peers
//!   trust. Connected as soon as it is constructed.
//! - [`PeerToPeerTransport`]: a negotiated session with a reliable and an
//!   unreliable data channel, driven through the [`PeerSession`] seam.
//! - [`memory`]: an in-process [`PeerSession`] engine.
//!
//! [`ConnectionState`]: studiolink_types::ConnectionState
//! [`CorrelationEngine`]: studiolink_wire::CorrelationEngine

pub mod lifecycle;
pub mod local;
pub mod memory;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod transport;

pub use lifecycle::TransportCore;
pub use local::{port_pair, LocalBrokerTransport, LocalPort};
pub use memory::{MemoryChannel, MemoryNetwork, MemorySession};
pub use negotiation::{Negotiator, SignalMessage};
pub use peer::{PeerToPeerTransport, SignalSink, RELIABLE_CHANNEL, UNRELIABLE_CHANNEL};
pub use session::{
    ChannelEvent, ChannelFrame, ChannelReliability, DataChannel, IceCandidate, NegotiationError,
    PeerSession, SdpType, SessionDescription, SessionEvent, SessionFactory, SessionState,
};
pub use transport::{wait_for_state, Transport, TransportKind};
