//! In-process session engine.
//!
//! Sessions created from the same [`MemoryNetwork`] find each other through
//! the token embedded in their session descriptions. Two sessions link once
//! each has a local description, the other's description and at least one
//! of the other's candidates applied. Linking pairs up their data channels
//! and reports both sessions connected.

use crate::session::{
    ChannelEvent, ChannelFrame, ChannelReliability, DataChannel, IceCandidate, NegotiationError,
    PeerSession, SdpType, SessionDescription, SessionEvent, SessionFactory, SessionState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use studiolink_types::{TransportError, TransportResult};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct NetworkInner {
    sessions: Mutex<HashMap<String, Weak<MemorySession>>>,
    /// Held while two sessions link so each pair links exactly once.
    link: Mutex<()>,
}

impl NetworkInner {
    fn lookup(&self, token: &str) -> Option<Arc<MemorySession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .and_then(Weak::upgrade)
    }

    fn forget(&self, token: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }
}

/// A shared medium for [`MemorySession`]s. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session on this network.
    pub fn session(&self) -> Arc<MemorySession> {
        let token = Uuid::new_v4().simple().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|me| MemorySession {
            token: token.clone(),
            network: self.inner.clone(),
            me: me.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inner: Mutex::new(SessionInner::default()),
        });
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, Arc::downgrade(&session));
        session
    }

    /// Number of sessions that are still open.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }
}

impl SessionFactory for MemoryNetwork {
    fn create_session(&self) -> Arc<dyn PeerSession> {
        self.session()
    }
}

struct SessionInner {
    state: SessionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_token: Option<String>,
    remote_candidates: usize,
    sdp_version: u64,
    linked: bool,
    peer: Weak<MemorySession>,
    channels: Vec<Arc<MemoryChannel>>,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            state: SessionState::New,
            local: None,
            remote: None,
            remote_token: None,
            remote_candidates: 0,
            sdp_version: 0,
            linked: false,
            peer: Weak::new(),
            channels: Vec::new(),
        }
    }
}

/// A [`PeerSession`] on a [`MemoryNetwork`].
pub struct MemorySession {
    token: String,
    network: Arc<NetworkInner>,
    me: Weak<MemorySession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    inner: Mutex<SessionInner>,
}

/// The token from the `o=` line of a description.
fn session_token(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
}

impl MemorySession {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The channel with `label`, whether created locally or by the peer.
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        self.lock()
            .channels
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    /// Simulate a connectivity failure on this side.
    pub fn fail(&self) {
        let peer = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            self.set_state(&mut inner, SessionState::Failed);
            inner.peer.upgrade()
        };
        if let Some(peer) = peer {
            peer.remote_gone();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state != state {
            inner.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn describe(&self, version: u64) -> String {
        format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n",
            self.token, version
        )
    }

    fn ensure_open(inner: &SessionInner) -> Result<(), NegotiationError> {
        if inner.state == SessionState::Closed {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn ready_for_link(&self) -> Option<String> {
        let inner = self.lock();
        let ready = !inner.linked
            && !inner.state.is_terminal()
            && inner.local.is_some()
            && inner.remote_candidates > 0;
        if ready {
            inner.remote_token.clone()
        } else {
            None
        }
    }

    fn try_link(&self) {
        let Some(remote_token) = self.ready_for_link() else {
            return;
        };
        let _link = self.network.link.lock().unwrap_or_else(|e| e.into_inner());
        if self.ready_for_link().is_none() {
            return;
        }
        let Some(peer) = self.network.lookup(&remote_token) else {
            debug!(token = %remote_token, "Remote session not found on this network");
            return;
        };
        if peer.ready_for_link().as_deref() != Some(self.token.as_str()) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        link(&me, &peer);
    }

    fn mark_linked(&self, peer: &Arc<MemorySession>) -> Vec<Arc<MemoryChannel>> {
        let mut inner = self.lock();
        inner.linked = true;
        inner.peer = Arc::downgrade(peer);
        self.set_state(&mut inner, SessionState::Connected);
        inner.channels.clone()
    }

    /// Create the local end of a channel the peer opened.
    fn accept_channel(&self, origin: &MemoryChannel) -> Arc<MemoryChannel> {
        let channel = MemoryChannel::new(&origin.label, origin.reliability);
        self.lock().channels.push(channel.clone());
        self.emit(SessionEvent::DataChannel(channel.clone()));
        channel
    }

    fn remote_gone(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        debug!(token = %self.token, "Remote session went away");
        self.set_state(&mut inner, SessionState::Disconnected);
    }
}

fn link(a: &Arc<MemorySession>, b: &Arc<MemorySession>) {
    debug!(a = %a.token, b = %b.token, "Linking sessions");
    let a_channels = a.mark_linked(b);
    let b_channels = b.mark_linked(a);

    let mut opened = Vec::new();
    for (origin, acceptor) in [(a_channels, b), (b_channels, a)] {
        for channel in origin {
            let counterpart = acceptor.accept_channel(&channel);
            MemoryChannel::pair(&channel, &counterpart);
            opened.push(channel);
            opened.push(counterpart);
        }
    }
    for channel in opened {
        channel.open();
    }
}

#[async_trait]
impl PeerSession for MemorySession {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;
        inner.sdp_version += 1;
        Ok(SessionDescription::offer(self.describe(inner.sdp_version)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;
        let has_offer = inner
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(NegotiationError::InvalidState(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        inner.sdp_version += 1;
        Ok(SessionDescription::answer(self.describe(inner.sdp_version)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        {
            let mut inner = self.lock();
            Self::ensure_open(&inner)?;
            if session_token(&description.sdp) != Some(self.token.as_str()) {
                return Err(NegotiationError::InvalidDescription(
                    "local description was not created by this session".to_string(),
                ));
            }
            inner.local = Some(description);
            if inner.state == SessionState::New {
                self.set_state(&mut inner, SessionState::Connecting);
            }
        }
        self.emit(SessionEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 mem-{} 9 typ host", self.token),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        {
            let mut inner = self.lock();
            Self::ensure_open(&inner)?;
            let token = session_token(&description.sdp)
                .ok_or_else(|| NegotiationError::InvalidDescription("missing origin".to_string()))?;
            if token == self.token {
                return Err(NegotiationError::InvalidDescription(
                    "remote description is our own".to_string(),
                ));
            }
            inner.remote_token = Some(token.to_string());
            inner.remote = Some(description);
            if inner.state == SessionState::New {
                self.set_state(&mut inner, SessionState::Connecting);
            }
        }
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        {
            let mut inner = self.lock();
            Self::ensure_open(&inner)?;
            if inner.remote.is_none() {
                return Err(NegotiationError::InvalidState(
                    "remote description not set".to_string(),
                ));
            }
            if candidate.candidate.trim().is_empty() {
                return Err(NegotiationError::InvalidCandidate(
                    "empty candidate".to_string(),
                ));
            }
            inner.remote_candidates += 1;
        }
        self.try_link();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        reliability: ChannelReliability,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let channel = MemoryChannel::new(label, reliability);
        let peer = {
            let mut inner = self.lock();
            Self::ensure_open(&inner)?;
            inner.channels.push(channel.clone());
            if inner.linked {
                inner.peer.upgrade()
            } else {
                None
            }
        };
        if let Some(peer) = peer {
            let counterpart = peer.accept_channel(&channel);
            MemoryChannel::pair(&channel, &counterpart);
            channel.open();
            counterpart.open();
        }
        Ok(channel)
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn close(&self) {
        let (channels, peer) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            self.set_state(&mut inner, SessionState::Closed);
            inner.linked = false;
            (
                std::mem::take(&mut inner.channels),
                std::mem::take(&mut inner.peer).upgrade(),
            )
        };
        for channel in channels {
            channel.close();
        }
        self.network.forget(&self.token);
        if let Some(peer) = peer {
            peer.remote_gone();
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.network.forget(&self.token);
    }
}

/// A [`DataChannel`] between two [`MemorySession`]s.
pub struct MemoryChannel {
    label: String,
    reliability: ChannelReliability,
    open: AtomicBool,
    events_tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    remote: Mutex<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    fn new(label: &str, reliability: ChannelReliability) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            reliability,
            open: AtomicBool::new(false),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            remote: Mutex::new(Weak::new()),
        })
    }

    fn pair(a: &Arc<MemoryChannel>, b: &Arc<MemoryChannel>) {
        *a.remote.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(b);
        *b.remote.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(a);
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = self
            .events_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEvent::Open);
        }
    }

    /// Close this end only. Closed channels never reopen.
    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.emit(ChannelEvent::Close);
        }
        self.events_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn reliability(&self) -> ChannelReliability {
        self.reliability
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ChannelFrame) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::NotOpen(format!(
                "channel '{}' is not open",
                self.label
            )));
        }
        let remote = self.remote.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
        match remote {
            Some(remote) if remote.is_open() => {
                remote.emit(ChannelEvent::Message(frame));
                Ok(())
            }
            _ => Err(TransportError::SendFailed(format!(
                "remote end of '{}' is gone",
                self.label
            ))),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn close(&self) {
        self.shut();
        let remote = self.remote.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
        if let Some(remote) = remote {
            remote.shut();
        }
    }
}
