//! CorrelationEngine: many concurrent calls over one message channel.
//!
//! The engine knows nothing about the medium. A transport installs a send
//! hook and feeds every inbound [`Envelope`] to
//! [`CorrelationEngine::handle_received`]. Outgoing calls are tagged with a
//! fresh id and parked as pending until a response with the same id arrives;
//! arrival order does not matter. Incoming requests are dispatched to the
//! locally registered handler on their own task, so a slow handler never
//! holds up the next message.

use crate::codec::{DefaultErrorCodec, ErrorCodec, HandlerError};
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, MessageBody, WireMessage};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use studiolink_types::config::RpcConfig;
use studiolink_types::TransportError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Hook the engine uses to put an envelope on the channel.
pub type SendHook = Arc<dyn Fn(Envelope) -> Result<(), TransportError> + Send + Sync>;

type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<HandlerReply, HandlerError>> + Send + Sync>;

/// An incoming call, as seen by a local handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub command: String,
    pub args: Vec<Value>,
    pub transfer: Vec<Bytes>,
}

/// What a handler wants sent back.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// Respond with a value and optional transferred buffers.
    Value { value: Value, transfer: Vec<Bytes> },
    /// Send no response at all. Used for requests whose sender said it does
    /// not expect one, so no unresolvable call piles up on the other side.
    NoResponse,
}

impl HandlerReply {
    pub fn value(value: impl Into<Value>) -> Self {
        HandlerReply::Value {
            value: value.into(),
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(value: impl Into<Value>, transfer: Vec<Bytes>) -> Self {
        HandlerReply::Value {
            value: value.into(),
            transfer,
        }
    }

    pub fn no_response() -> Self {
        HandlerReply::NoResponse
    }
}

impl From<Value> for HandlerReply {
    fn from(value: Value) -> Self {
        HandlerReply::value(value)
    }
}

/// A successful call result.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub value: Value,
    pub transfer: Vec<Bytes>,
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the engine default. `Some(Duration::ZERO)` disables the timeout.
    pub timeout: Option<Duration>,
    /// Buffers moved alongside the request.
    pub transfer: Vec<Bytes>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn transfer(mut self, transfer: Vec<Bytes>) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Engine-wide settings.
#[derive(Clone)]
pub struct EngineConfig {
    /// Timeout for calls that don't set their own (zero = disabled).
    pub default_timeout: Duration,
    pub error_codec: Arc<dyn ErrorCodec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::ZERO,
            error_codec: Arc::new(DefaultErrorCodec),
        }
    }
}

impl EngineConfig {
    pub fn from_rpc_config(config: &RpcConfig) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            ..Default::default()
        }
    }

    pub fn with_error_codec(mut self, codec: Arc<dyn ErrorCodec>) -> Self {
        self.error_codec = codec;
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

struct PendingCall {
    command: String,
    tx: oneshot::Sender<RpcResult<Response>>,
}

struct EngineInner {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    handlers: RwLock<HashMap<String, Handler>>,
    send_hook: RwLock<Option<SendHook>>,
    config: EngineConfig,
}

/// Removes the pending entry when a call returns early or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingCall>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Request/response correlation over one channel. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<EngineInner>,
}

impl CorrelationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                handlers: RwLock::new(HashMap::new()),
                send_hook: RwLock::new(None),
                config,
            }),
        }
    }

    /// Attach the channel this engine writes to.
    pub fn set_send_hook<F>(&self, hook: F)
    where
        F: Fn(Envelope) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        let mut slot = self.inner.send_hook.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(hook));
    }

    /// Detach the channel; later sends fail with [`TransportError::NotOpen`].
    pub fn clear_send_hook(&self) {
        let mut slot = self.inner.send_hook.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    /// Register the local handler for `command`, replacing any previous one.
    pub fn register<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerReply, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| handler(req).boxed());
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(command.into(), handler);
    }

    /// Remove the handler for `command`. Returns whether one was registered.
    pub fn unregister(&self, command: &str) -> bool {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(command).is_some()
    }

    pub fn has_handler(&self, command: &str) -> bool {
        let handlers = self.inner.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(command)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `command` on the remote side and wait for its return value.
    pub async fn call(&self, command: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.call_with(command, args, CallOptions::default())
            .await
            .map(|r| r.value)
    }

    /// Call `command` with explicit options.
    ///
    /// Fails synchronously with [`RpcError::Transport`] when the channel
    /// refuses the request. On timeout the pending call is abandoned; a late
    /// response for it is discarded.
    pub async fn call_with(
        &self,
        command: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> RpcResult<Response> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            id,
            PendingCall {
                command: command.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        self.send(Envelope::with_transfer(
            WireMessage::request(id, command, args),
            options.transfer,
        ))?;
        debug!(id, command, "Call sent");

        let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);
        let outcome = if timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(id, command, ?timeout, "Call timed out");
                    return Err(RpcError::Timeout {
                        command: command.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        };

        outcome.unwrap_or(Err(RpcError::Disconnected))
    }

    /// Send a request without waiting for, or keeping state about, a response.
    ///
    /// The remote handler should answer with [`HandlerReply::NoResponse`];
    /// a response that arrives anyway is dropped like any late response.
    pub fn notify(
        &self,
        command: &str,
        args: Vec<Value>,
        transfer: Vec<Bytes>,
    ) -> Result<(), RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Envelope::with_transfer(
            WireMessage::request(id, command, args),
            transfer,
        ))?;
        debug!(id, command, "Notification sent");
        Ok(())
    }

    /// Feed one inbound envelope to the engine.
    ///
    /// Requests run on a spawned task and must be called from within a tokio
    /// runtime. Responses resolve their pending call immediately.
    pub fn handle_received(&self, envelope: Envelope) {
        let Envelope { message, transfer } = envelope;
        match message.body {
            MessageBody::Request { args } => {
                self.dispatch_request(Request {
                    id: message.id,
                    command: message.command,
                    args,
                    transfer,
                });
            }
            MessageBody::Response {
                did_throw,
                return_value,
            } => self.resolve(message.id, &message.command, did_throw, return_value, transfer),
        }
    }

    /// Fail every outstanding call with [`RpcError::Disconnected`].
    /// Returns how many calls were rejected.
    pub fn reject_all(&self) -> usize {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                debug!(id, command = %pending.command, "Rejecting pending call");
                let _ = pending.tx.send(Err(RpcError::Disconnected));
                rejected += 1;
            }
        }
        rejected
    }

    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let hook = self
            .inner
            .send_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match hook {
            Some(hook) => hook(envelope),
            None => Err(TransportError::NotOpen("no channel attached".to_string())),
        }
    }

    fn resolve(
        &self,
        id: u64,
        command: &str,
        did_throw: bool,
        value: Value,
        transfer: Vec<Bytes>,
    ) {
        let Some((_, pending)) = self.inner.pending.remove(&id) else {
            debug!(id, command, "Dropping response without a pending call");
            return;
        };
        let result = if did_throw {
            Err(RpcError::Remote(self.inner.config.error_codec.deserialize(value)))
        } else {
            Ok(Response { value, transfer })
        };
        let _ = pending.tx.send(result);
    }

    fn dispatch_request(&self, request: Request) {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.command)
            .cloned();
        let engine = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let id = request.id;
            let command = request.command.clone();
            let (did_throw, value, transfer) = match handler {
                None => {
                    debug!(id, command = %command, "No handler registered, responding with null");
                    (false, Value::Null, Vec::new())
                }
                Some(handler) => match handler(request).await {
                    Ok(HandlerReply::Value { value, transfer }) => (false, value, transfer),
                    Ok(HandlerReply::NoResponse) => {
                        debug!(id, command = %command, "Handler suppressed its response");
                        return;
                    }
                    Err(e) => {
                        debug!(id, command = %command, error = %e, "Handler failed");
                        let Some(inner) = engine.upgrade() else {
                            return;
                        };
                        (true, inner.config.error_codec.serialize(&e), Vec::new())
                    }
                },
            };

            let Some(inner) = engine.upgrade() else {
                debug!(id, command = %command, "Engine dropped before response was sent");
                return;
            };
            let engine = CorrelationEngine { inner };
            let response = Envelope::with_transfer(
                WireMessage::response(id, command.clone(), did_throw, value),
                transfer,
            );
            if let Err(e) = engine.send(response) {
                warn!(id, command = %command, error = %e, "Failed to send response");
            }
        });
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};
    use tokio_test::{assert_err, assert_ok};

    /// Route everything `from` sends into `to`.
    fn connect(from: &CorrelationEngine, to: &CorrelationEngine) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        from.set_send_hook(move |env| tx.send(env).map_err(|_| TransportError::Closed));
        let to = to.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                to.handle_received(env);
            }
        });
    }

    fn linked_pair() -> (CorrelationEngine, CorrelationEngine) {
        let a = CorrelationEngine::default();
        let b = CorrelationEngine::default();
        connect(&a, &b);
        connect(&b, &a);
        (a, b)
    }

    /// An engine whose outgoing envelopes are captured for manual delivery.
    fn capturing() -> (CorrelationEngine, Arc<Mutex<Vec<Envelope>>>) {
        let engine = CorrelationEngine::default();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        engine.set_send_hook(move |env| {
            sink.lock().unwrap().push(env);
            Ok(())
        });
        (engine, sent)
    }

    async fn wait_for_sent(sent: &Arc<Mutex<Vec<Envelope>>>, count: usize) {
        for _ in 0..100 {
            if sent.lock().unwrap().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} sent envelopes");
    }

    fn id_of(sent: &Arc<Mutex<Vec<Envelope>>>, command: &str) -> u64 {
        sent.lock()
            .unwrap()
            .iter()
            .find(|e| e.message.command == command)
            .map(|e| e.message.id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_responses_correlate_by_id_not_order() {
        let (engine, sent) = capturing();

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call("a", vec![]).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call("b", vec![]).await }
        });
        wait_for_sent(&sent, 2).await;

        let (id_a, id_b) = (id_of(&sent, "a"), id_of(&sent, "b"));
        assert_ne!(id_a, id_b);
        engine.handle_received(Envelope::new(WireMessage::response(
            id_b,
            "b",
            false,
            json!("result-b"),
        )));
        engine.handle_received(Envelope::new(WireMessage::response(
            id_a,
            "a",
            false,
            json!("result-a"),
        )));

        assert_eq!(a.await.unwrap().unwrap(), json!("result-a"));
        assert_eq!(b.await.unwrap().unwrap(), json!("result-b"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_through_handler() {
        let (a, b) = linked_pair();
        b.register("math.add", |req: Request| async move {
            let sum: i64 = req.args.iter().filter_map(Value::as_i64).sum();
            Ok(HandlerReply::value(sum))
        });

        let result = assert_ok!(a.call("math.add", vec![json!(2), json!(40)]).await);
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_thrown_error_preserves_message() {
        let (a, b) = linked_pair();
        b.register("explode", |_req: Request| async move {
            Err::<HandlerReply, HandlerError>(Box::new(RemoteError::new("TypeError", "x")))
        });

        let err = assert_err!(a.call("explode", vec![]).await);
        let remote = err.remote().expect("remote error");
        assert_eq!(remote.message, "x");
        assert_eq!(remote.name, "TypeError");
    }

    #[tokio::test]
    async fn test_missing_handler_resolves_null() {
        let (a, _b) = linked_pair();
        let result = assert_ok!(a.call("nobody.home", vec![json!(1)]).await);
        assert!(result.is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_ignored() {
        let (engine, sent) = capturing();

        let err = engine
            .call_with(
                "slow",
                vec![],
                CallOptions::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(engine.pending_count(), 0);

        let id = id_of(&sent, "slow");
        engine.handle_received(Envelope::new(WireMessage::response(
            id,
            "slow",
            false,
            json!("too late"),
        )));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_default_timeout_applies() {
        let engine = CorrelationEngine::new(EngineConfig {
            default_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        engine.set_send_hook(|_| Ok(()));
        let err = assert_err!(engine.call("never", vec![]).await);
        assert!(matches!(err, RpcError::Timeout { timeout_ms: 5000, .. }));
    }

    #[tokio::test]
    async fn test_no_response_sentinel_sends_nothing() {
        let (a, a_sent) = capturing();
        let (b, b_sent) = capturing();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        b.register("log.append", move |_req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReply::no_response())
            }
        });

        assert_ok!(a.notify("log.append", vec![json!("line")], vec![]));
        assert_eq!(a.pending_count(), 0);
        let envelope = a_sent.lock().unwrap().pop().unwrap();
        b.handle_received(envelope);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(b_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_others() {
        let (a, b) = linked_pair();
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        b.register("slow", move |_req: Request| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(HandlerReply::value("slow done"))
            }
        });
        b.register("fast", |_req: Request| async move { Ok(HandlerReply::value("fast done")) });

        let slow = tokio::spawn({
            let a = a.clone();
            async move { a.call("slow", vec![]).await }
        });
        assert_eq!(a.call("fast", vec![]).await.unwrap(), json!("fast done"));
        assert!(!slow.is_finished());

        release.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), json!("slow done"));
    }

    #[tokio::test]
    async fn test_reject_all_fails_pending_calls() {
        let (engine, sent) = capturing();
        let call = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call("pending", vec![]).await }
        });
        wait_for_sent(&sent, 1).await;

        assert_eq!(engine.reject_all(), 1);
        assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn test_send_without_channel_fails_synchronously() {
        let engine = CorrelationEngine::default();
        let err = engine.call("x", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Transport(TransportError::NotOpen(_))
        ));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_buffers_travel_both_ways() {
        let (a, b) = linked_pair();
        b.register("echo.bytes", |req: Request| async move {
            let total: usize = req.transfer.iter().map(Bytes::len).sum();
            Ok(HandlerReply::with_transfer(total, req.transfer))
        });

        let response = a
            .call_with(
                "echo.bytes",
                vec![],
                CallOptions::default().transfer(vec![Bytes::from_static(b"abc")]),
            )
            .await
            .unwrap();
        assert_eq!(response.value, json!(3));
        assert_eq!(response.transfer, vec![Bytes::from_static(b"abc")]);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (engine, sent) = capturing();
        for _ in 0..3 {
            engine.notify("tick", vec![], vec![]).unwrap();
        }
        let ids: Vec<u64> = sent.lock().unwrap().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
