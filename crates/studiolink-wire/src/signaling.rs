//! Discovery-server protocol.
//!
//! JSON text frames over a websocket, discriminated by `op`. Clients announce
//! themselves and their project, the server answers with the set of other
//! registered clients and keeps it current, and both directions relay opaque
//! negotiation payloads between two peer ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use studiolink_types::{AvailablePeer, ClientRole, PeerId, ProjectMetadata};

/// Client → server operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientOp {
    /// Become visible to other clients under the given role.
    RegisterClient { role: ClientRole },
    /// Publish (or clear, with `null`) the project this client has open.
    #[serde(rename_all = "camelCase")]
    SetProjectMetadata { metadata: Option<ProjectMetadata> },
    /// Forward `data` to another client.
    #[serde(rename_all = "camelCase")]
    RelayMessage { to_peer_id: PeerId, data: Value },
}

/// Server → client operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerOp {
    /// Full snapshot of every other registered client.
    SetAvailableConnections { connections: Vec<AvailablePeer> },
    AddAvailableConnection { connection: AvailablePeer },
    RemoveAvailableConnection { id: PeerId },
    SetConnectionProjectMetadata {
        id: PeerId,
        metadata: Option<ProjectMetadata>,
    },
    /// `data` as sent by `from_peer_id` in its `relayMessage`.
    #[serde(rename_all = "camelCase")]
    RelayMessage { from_peer_id: PeerId, data: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_op_shapes() {
        let op = ClientOp::RelayMessage {
            to_peer_id: PeerId::from("p2"),
            data: json!({"type": "sdp", "payload": {}}),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "relayMessage");
        assert_eq!(value["toPeerId"], "p2");

        let op: ClientOp = serde_json::from_str(r#"{"op":"registerClient","role":"host"}"#).unwrap();
        assert_eq!(op, ClientOp::RegisterClient { role: ClientRole::Host });

        let op: ClientOp =
            serde_json::from_str(r#"{"op":"setProjectMetadata","metadata":null}"#).unwrap();
        assert_eq!(op, ClientOp::SetProjectMetadata { metadata: None });
    }

    #[test]
    fn test_server_op_shapes() {
        let op = ServerOp::AddAvailableConnection {
            connection: AvailablePeer::new("p1", ClientRole::Inspector),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "addAvailableConnection");
        assert_eq!(value["connection"]["role"], "inspector");

        let op: ServerOp = serde_json::from_value(json!({
            "op": "relayMessage",
            "fromPeerId": "p9",
            "data": {"type": "iceCandidate", "payload": {"candidate": "c"}}
        }))
        .unwrap();
        match op {
            ServerOp::RelayMessage { from_peer_id, data } => {
                assert_eq!(from_peer_id.as_str(), "p9");
                assert_eq!(data["type"], "iceCandidate");
            }
            other => panic!("Expected relayMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(serde_json::from_str::<ServerOp>(r#"{"op":"launchMissiles"}"#).is_err());
    }
}
