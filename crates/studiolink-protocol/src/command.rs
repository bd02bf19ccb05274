//! One entry in the command catalog.

use crate::error::{CommandError, CommandResult};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use studiolink_wire::HandlerError;

/// When a payload is flattened to JSON text before it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializeCondition {
    Always,
    #[default]
    Never,
    /// Only over transports that cannot carry structured values natively.
    IfNotSupported,
}

impl SerializeCondition {
    pub fn applies(self, supports_structured: bool) -> bool {
        match self {
            SerializeCondition::Always => true,
            SerializeCondition::Never => false,
            SerializeCondition::IfNotSupported => !supports_structured,
        }
    }
}

/// A value plus the binary buffers moved alongside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub value: Value,
    pub transfer: Vec<Bytes>,
}

impl Payload {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(value: impl Into<Value>, transfer: Vec<Bytes>) -> Self {
        Self {
            value: value.into(),
            transfer,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::new(value)
    }
}

pub type PrepareFn = dyn Fn(Value) -> BoxFuture<'static, CommandResult<Payload>> + Send + Sync;
pub type RequestFn =
    dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, HandlerError>> + Send + Sync;
pub type ResponseFn = dyn Fn(Payload) -> BoxFuture<'static, CommandResult<Value>> + Send + Sync;

/// A named command: how the caller shapes the request and the response,
/// and how the callee executes it.
pub struct RegisteredCommand {
    name: String,
    pub(crate) prepare: Option<Arc<PrepareFn>>,
    pub(crate) handle_request: Arc<RequestFn>,
    pub(crate) handle_response: Option<Arc<ResponseFn>>,
    pub(crate) request_serialization: SerializeCondition,
    pub(crate) response_serialization: SerializeCondition,
    pub(crate) expects_response: bool,
}

impl RegisteredCommand {
    /// A command executed by `handle_request` on the side that receives it.
    pub fn new<F, Fut>(name: impl Into<String>, handle_request: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            prepare: None,
            handle_request: Arc::new(move |payload| handle_request(payload).boxed()),
            handle_response: None,
            request_serialization: SerializeCondition::default(),
            response_serialization: SerializeCondition::default(),
            expects_response: true,
        }
    }

    /// Shape the caller's arguments into the request payload.
    pub fn prepare<F, Fut>(mut self, prepare: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult<Payload>> + Send + 'static,
    {
        self.prepare = Some(Arc::new(move |args| prepare(args).boxed()));
        self
    }

    /// Reshape the raw response before the caller sees it.
    pub fn handle_response<F, Fut>(mut self, handle_response: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult<Value>> + Send + 'static,
    {
        self.handle_response = Some(Arc::new(move |payload| handle_response(payload).boxed()));
        self
    }

    pub fn request_serialization(mut self, condition: SerializeCondition) -> Self {
        self.request_serialization = condition;
        self
    }

    pub fn response_serialization(mut self, condition: SerializeCondition) -> Self {
        self.response_serialization = condition;
        self
    }

    /// Mark the command as fire-and-forget: the callee never answers.
    pub fn without_response(mut self) -> Self {
        self.expects_response = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expects_response(&self) -> bool {
        self.expects_response
    }
}

impl std::fmt::Debug for RegisteredCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCommand")
            .field("name", &self.name)
            .field("prepare", &self.prepare.is_some())
            .field("handle_response", &self.handle_response.is_some())
            .field("request_serialization", &self.request_serialization)
            .field("response_serialization", &self.response_serialization)
            .field("expects_response", &self.expects_response)
            .finish()
    }
}

pub(crate) fn encode_payload(value: Value, serialize: bool) -> CommandResult<Value> {
    if serialize {
        Ok(Value::String(serde_json::to_string(&value)?))
    } else {
        Ok(value)
    }
}

/// Undo [`encode_payload`]. A null stays null: it is what a peer without a
/// handler answers.
pub(crate) fn decode_payload(command: &str, value: Value, serialize: bool) -> CommandResult<Value> {
    if !serialize {
        return Ok(value);
    }
    match value {
        Value::String(text) => Ok(serde_json::from_str(&text)?),
        Value::Null => Ok(Value::Null),
        _ => Err(CommandError::MalformedPayload {
            command: command.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_condition_table() {
        assert!(SerializeCondition::Always.applies(true));
        assert!(SerializeCondition::Always.applies(false));
        assert!(!SerializeCondition::Never.applies(false));
        assert!(!SerializeCondition::IfNotSupported.applies(true));
        assert!(SerializeCondition::IfNotSupported.applies(false));
    }

    #[test]
    fn test_serialized_payload_is_text_on_the_wire() {
        let encoded = encode_payload(json!({"path": "a/b", "n": [1, 2]}), true).unwrap();
        assert!(encoded.is_string());
        let decoded = decode_payload("read", encoded, true).unwrap();
        assert_eq!(decoded, json!({"path": "a/b", "n": [1, 2]}));
    }

    #[test]
    fn test_decode_rejects_structured_value_when_text_expected() {
        let err = decode_payload("read", json!({"a": 1}), true).unwrap_err();
        assert!(matches!(err, CommandError::MalformedPayload { command } if command == "read"));
        assert_eq!(decode_payload("read", Value::Null, true).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_builder_keeps_hooks() {
        let command = RegisteredCommand::new("echo", |p: Payload| async move { Ok(p) })
            .prepare(|args| async move { Ok(Payload::new(json!([args]))) })
            .response_serialization(SerializeCondition::Always)
            .without_response();

        assert_eq!(command.name(), "echo");
        assert!(!command.expects_response());
        assert_eq!(command.response_serialization, SerializeCondition::Always);
        assert_eq!(command.request_serialization, SerializeCondition::Never);

        let prepare = command.prepare.clone().unwrap();
        let prepared = prepare(json!(1)).await.unwrap();
        assert_eq!(prepared.value, json!([1]));
        let handled = (command.handle_request)(Payload::new("x")).await.unwrap();
        assert_eq!(handled, Payload::new("x"));
    }
}
