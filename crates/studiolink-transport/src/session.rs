//! The seam between the peer-to-peer transport and a session engine.
//!
//! A session engine establishes one negotiated connection (session
//! descriptions, ICE candidates, data channels) with a remote peer. The
//! transport only drives these traits, so any engine can sit behind it: the
//! in-memory one in [`crate::memory`], or a native stack.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studiolink_types::TransportResult;
use thiserror::Error;
use tokio::sync::mpsc;

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// State of the underlying session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// Whether the session is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

/// Delivery guarantees of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReliability {
    /// Ordered, retransmitted.
    Reliable,
    /// Unordered, never retransmitted.
    Unreliable,
}

/// One data channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelFrame),
    Close,
}

pub enum SessionEvent {
    /// A local candidate to relay to the remote peer.
    IceCandidate(IceCandidate),
    /// The session wants a fresh offer/answer round.
    NegotiationNeeded,
    StateChanged(SessionState),
    /// The remote peer opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            SessionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            SessionEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            SessionEvent::DataChannel(c) => f.debug_tuple("DataChannel").field(&c.label()).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("Session closed")]
    Closed,
}

/// One data channel within a session.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn reliability(&self) -> ChannelReliability;

    fn is_open(&self) -> bool;

    fn send(&self, frame: ChannelFrame) -> TransportResult<()>;

    /// Take the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    fn close(&self);
}

/// One negotiated connection to a remote peer.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Fails if no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn create_data_channel(
        &self,
        label: &str,
        reliability: ChannelReliability,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    fn state(&self) -> SessionState;

    /// Take the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;

    fn close(&self);
}

/// Creates fresh sessions for new peer-to-peer transports.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self) -> Arc<dyn PeerSession>;
}
