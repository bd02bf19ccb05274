//! Wire protocol message types.
//!
//! Every call between two peers is a `request` record answered by exactly one
//! `response` record carrying the same `id`. Transports that can move
//! structured values hand [`Envelope`]s across untouched; text-only transports
//! encode them with [`encode_text`] and decode with [`decode_text`].

use crate::error::{WireError, WireResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum encoded frame size for text transports (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A wire protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlation id, unique per sending engine while the call is outstanding.
    pub id: u64,
    /// The command name.
    #[serde(rename = "type")]
    pub command: String,
    /// Request arguments or response outcome.
    #[serde(flatten)]
    pub body: MessageBody,
}

/// The two message directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum MessageBody {
    /// A call to a named handler on the remote side.
    Request {
        #[serde(default)]
        args: Vec<Value>,
    },
    /// The outcome of a request.
    Response {
        /// True when `return_value` is a serialized error.
        #[serde(rename = "didThrow", default)]
        did_throw: bool,
        /// The handler's return value, or the serialized error.
        #[serde(rename = "returnValue", default)]
        return_value: Value,
    },
}

impl WireMessage {
    /// Build a request message.
    pub fn request(id: u64, command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id,
            command: command.into(),
            body: MessageBody::Request { args },
        }
    }

    /// Build a response message.
    pub fn response(
        id: u64,
        command: impl Into<String>,
        did_throw: bool,
        return_value: Value,
    ) -> Self {
        Self {
            id,
            command: command.into(),
            body: MessageBody::Response {
                did_throw,
                return_value,
            },
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, MessageBody::Request { .. })
    }
}

/// A message plus binary buffers moved alongside it.
///
/// The buffers are a transfer hint: channels that can hand over ownership move
/// them as-is, others inline them into the encoded frame. They are not part of
/// the message's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: WireMessage,
    pub transfer: Vec<Bytes>,
}

impl Envelope {
    pub fn new(message: WireMessage) -> Self {
        Self {
            message,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(message: WireMessage, transfer: Vec<Bytes>) -> Self {
        Self { message, transfer }
    }
}

#[derive(Serialize)]
struct FrameOut<'a> {
    #[serde(flatten)]
    message: &'a WireMessage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transfer: Vec<String>,
}

#[derive(Deserialize)]
struct FrameIn {
    #[serde(flatten)]
    message: WireMessage,
    #[serde(default)]
    transfer: Vec<String>,
}

/// Encode an envelope as a JSON text frame. Transferred buffers are carried
/// base64-encoded in a `transfer` array.
pub fn encode_text(envelope: &Envelope) -> WireResult<String> {
    let frame = FrameOut {
        message: &envelope.message,
        transfer: envelope.transfer.iter().map(|b| BASE64.encode(b)).collect(),
    };
    let text = serde_json::to_string(&frame)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(text)
}

/// Parse a JSON text frame produced by [`encode_text`].
pub fn decode_text(text: &str) -> WireResult<Envelope> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let frame: FrameIn = serde_json::from_str(text)?;
    let transfer = frame
        .transfer
        .iter()
        .map(|s| BASE64.decode(s).map(Bytes::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Envelope {
        message: frame.message,
        transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let msg = WireMessage::request(7, "fs.readFile", vec![json!("a/b.txt")]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"direction": "request", "id": 7, "type": "fs.readFile", "args": ["a/b.txt"]})
        );
    }

    #[test]
    fn test_response_shape() {
        let msg = WireMessage::response(7, "fs.readFile", false, json!({"size": 3}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["direction"], "response");
        assert_eq!(json["didThrow"], false);
        assert_eq!(json["returnValue"]["size"], 3);
    }

    #[test]
    fn test_response_without_return_value_is_null() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"direction":"response","id":1,"type":"x","didThrow":false}"#)
                .unwrap();
        match msg.body {
            MessageBody::Response { return_value, .. } => assert!(return_value.is_null()),
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_text_frame_carries_nested_values_and_binary() {
        let msg = WireMessage::request(
            3,
            "assets.bundle",
            vec![
                json!({"paths": ["a", "b"], "opts": {"level": 2, "ratio": 0.5}}),
                json!(null),
            ],
        );
        let envelope = Envelope::with_transfer(
            msg.clone(),
            vec![Bytes::from_static(&[0, 1, 2, 255]), Bytes::new()],
        );

        let text = encode_text(&envelope).unwrap();
        assert!(text.contains("\"transfer\""));
        let decoded = decode_text(&text).unwrap();
        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.transfer[0].as_ref(), &[0, 1, 2, 255]);
        assert!(decoded.transfer[1].is_empty());
    }

    #[test]
    fn test_text_frame_without_transfer_omits_field() {
        let text = encode_text(&Envelope::new(WireMessage::request(1, "ping", vec![]))).unwrap();
        assert!(!text.contains("transfer"));
        assert!(decode_text(&text).unwrap().transfer.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_text("not json"), Err(WireError::Json(_))));
        assert!(matches!(
            decode_text(r#"{"direction":"request","id":1,"type":"x","transfer":["@@@"]}"#),
            Err(WireError::Base64(_))
        ));
    }
}
