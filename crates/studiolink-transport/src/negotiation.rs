//! Offer/answer and candidate exchange for one peer-to-peer session.
//!
//! Signals travel as `{type: "sdp" | "iceCandidate", payload}` records,
//! relayed by whichever discovery backend created the transport.

use crate::session::{IceCandidate, NegotiationError, PeerSession, SdpType, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One negotiation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SignalMessage {
    Sdp(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalMessage {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Drives one side of a negotiation.
///
/// Whether this side is the initiator is fixed at construction. Only the
/// initiator ever creates offers; a renegotiation repeats the offer from the
/// same side. Candidates that arrive before the remote description are
/// queued and applied once it is set.
pub struct Negotiator {
    initiator: bool,
    session: Arc<dyn PeerSession>,
    has_remote_description: bool,
    queued_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub fn new(initiator: bool, session: Arc<dyn PeerSession>) -> Self {
        Self {
            initiator,
            session,
            has_remote_description: false,
            queued_candidates: Vec::new(),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Create and apply an offer. Returns the signal to relay, or `None` on
    /// the non-initiating side.
    pub async fn offer(&mut self) -> Result<Option<SignalMessage>, NegotiationError> {
        if !self.initiator {
            debug!("Not the initiator, skipping offer");
            return Ok(None);
        }
        let offer = self.session.create_offer().await?;
        self.session.set_local_description(offer.clone()).await?;
        Ok(Some(SignalMessage::Sdp(offer)))
    }

    /// Apply a signal from the remote peer. Returns the reply to relay, if any.
    pub async fn handle(
        &mut self,
        signal: SignalMessage,
    ) -> Result<Option<SignalMessage>, NegotiationError> {
        match signal {
            SignalMessage::Sdp(description) => match description.sdp_type {
                SdpType::Offer if self.initiator => {
                    debug!("Ignoring offer received by the initiator");
                    Ok(None)
                }
                SdpType::Offer => {
                    self.apply_remote(description).await?;
                    let answer = self.session.create_answer().await?;
                    self.session.set_local_description(answer.clone()).await?;
                    Ok(Some(SignalMessage::Sdp(answer)))
                }
                SdpType::Answer if !self.initiator => {
                    debug!("Ignoring answer received by the non-initiator");
                    Ok(None)
                }
                SdpType::Answer => {
                    self.apply_remote(description).await?;
                    Ok(None)
                }
            },
            SignalMessage::IceCandidate(candidate) => {
                if self.has_remote_description {
                    self.session.add_ice_candidate(candidate).await?;
                } else {
                    self.queued_candidates.push(candidate);
                }
                Ok(None)
            }
        }
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.session.set_remote_description(description).await?;
        self.has_remote_description = true;
        for candidate in std::mem::take(&mut self.queued_candidates) {
            self.session.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}
