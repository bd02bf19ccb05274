//! Error domain translation across the wire.

use crate::error::RemoteError;
use serde_json::Value;

/// The error type local handlers fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Converts handler errors to wire values and back.
///
/// Install a custom codec on both ends to carry error types the default one
/// would flatten to a name and message.
pub trait ErrorCodec: Send + Sync + 'static {
    /// Turn a thrown handler error into the `returnValue` of a response.
    fn serialize(&self, error: &HandlerError) -> Value;

    /// Rebuild an error from the `returnValue` of a response with `didThrow`.
    fn deserialize(&self, value: Value) -> RemoteError;
}

/// Preserves name, message and the source chain (as `stack`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorCodec;

impl ErrorCodec for DefaultErrorCodec {
    fn serialize(&self, error: &HandlerError) -> Value {
        let remote = match error.downcast_ref::<RemoteError>() {
            Some(remote) => remote.clone(),
            None => {
                let mut chain = Vec::new();
                let mut source = error.source();
                while let Some(cause) = source {
                    chain.push(format!("caused by: {cause}"));
                    source = cause.source();
                }
                RemoteError {
                    name: "Error".to_string(),
                    message: error.to_string(),
                    stack: (!chain.is_empty()).then(|| chain.join("\n")),
                }
            }
        };
        serde_json::to_value(remote).unwrap_or(Value::Null)
    }

    fn deserialize(&self, value: Value) -> RemoteError {
        let recognizable = value
            .as_object()
            .is_some_and(|obj| obj.get("message").is_some_and(Value::is_string));
        if !recognizable {
            return RemoteError::unknown();
        }
        serde_json::from_value(value).unwrap_or_else(|_| RemoteError::unknown())
    }
}
