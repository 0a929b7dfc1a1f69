//! JSON event protocol spoken over WebSocket text frames.
//!
//! Wire format, one envelope per frame:
//! ```text
//! {"event": "<name>", "data": <payload>}
//! ```
//!
//! | Direction | event | data |
//! |-----------|-------|------|
//! | client → server | `joinDocument` | `[documentType, documentId]` |
//! | client → server | `leaveDocument` | `[documentType, documentId]` |
//! | client → server | `documentChange` | `{documentType, documentId, ...}` |
//! | client → server | `sendMessage` | `{receiverId, ...}` |
//! | server → client | `connected` | `{connectionId}` |
//! | server → client | `updateDocument` | forwarded change payload |
//! | server → client | `receiveMessage` | forwarded chat message |
//!
//! Change payloads and chat messages are opaque: the server reads the
//! routing fields and forwards everything else untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::{ConnectionId, RoomName};

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join the room of `(documentType, documentId)`.
    JoinDocument(Value, Value),
    /// Leave the room of `(documentType, documentId)`.
    LeaveDocument(Value, Value),
    /// Change payload to relay to the rest of the document's room.
    DocumentChange(Value),
    /// Chat message addressed to `receiverId`.
    SendMessage(Value),
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Handshake: the id (and channel name) assigned to this connection.
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// A change made by another member of a joined room.
    UpdateDocument(Value),
    /// A chat message addressed to this connection's channel.
    ReceiveMessage(Value),
}

impl ClientMessage {
    pub fn join_document(document_type: impl Into<Value>, document_id: impl Into<Value>) -> Self {
        Self::JoinDocument(document_type.into(), document_id.into())
    }

    pub fn leave_document(document_type: impl Into<Value>, document_id: impl Into<Value>) -> Self {
        Self::LeaveDocument(document_type.into(), document_id.into())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

impl ServerMessage {
    pub fn connected(connection_id: &ConnectionId) -> Self {
        Self::Connected {
            connection_id: connection_id.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Room a change payload is addressed to.
///
/// `None` when `documentType` or `documentId` is missing.
pub fn change_target(payload: &Value) -> Option<RoomName> {
    let document_type = payload.get("documentType")?;
    let document_id = payload.get("documentId")?;
    Some(RoomName::document(document_type, document_id))
}

/// Channel a chat message is addressed to, from its `receiverId`.
pub fn message_target(message: &Value) -> Option<RoomName> {
    message.get("receiverId").map(RoomName::receiver)
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Unexpected handshake frame: {0}")]
    Handshake(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_document_wire_format() {
        let msg = ClientMessage::join_document("protocol", "42");
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"event": "joinDocument", "data": ["protocol", "42"]})
        );
    }

    #[test]
    fn test_decode_join_with_numeric_id() {
        let msg = ClientMessage::decode(r#"{"event":"joinDocument","data":["protocol",42]}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::JoinDocument(json!("protocol"), json!(42)));
    }

    #[test]
    fn test_decode_leave_document() {
        let msg = ClientMessage::decode(r#"{"event":"leaveDocument","data":["task","9"]}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::leave_document("task", "9"));
    }

    #[test]
    fn test_decode_document_change_keeps_extra_fields() {
        let text = r#"{"event":"documentChange","data":{"documentType":"protocol","documentId":"42","delta":"x","ops":[1,2]}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::DocumentChange(payload) => {
                assert_eq!(payload["delta"], "x");
                assert_eq!(payload["ops"], json!([1, 2]));
            }
            other => panic!("Expected DocumentChange, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_send_message() {
        let text = r#"{"event":"sendMessage","data":{"senderId":"A","receiverId":"B","text":"hi"}}"#;
        let msg = ClientMessage::decode(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SendMessage(json!({"senderId": "A", "receiverId": "B", "text": "hi"}))
        );
    }

    #[test]
    fn test_decode_unknown_event() {
        let err = ClientMessage::decode(r#"{"event":"deleteEverything","data":{}}"#);
        assert!(matches!(err, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"data":[]}"#).is_err());
    }

    #[test]
    fn test_connected_wire_format() {
        let msg = ServerMessage::connected(&ConnectionId::new("abc"));
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"event": "connected", "data": {"connectionId": "abc"}})
        );
    }

    #[test]
    fn test_update_document_forwards_payload_verbatim() {
        let payload = json!({"documentType": "protocol", "documentId": "42", "delta": "x"});
        let encoded = ServerMessage::UpdateDocument(payload.clone()).encode().unwrap();
        assert_eq!(
            ServerMessage::decode(&encoded).unwrap(),
            ServerMessage::UpdateDocument(payload)
        );
    }

    #[test]
    fn test_change_target() {
        let payload = json!({"documentType": "protocol", "documentId": 42, "delta": "x"});
        assert_eq!(change_target(&payload), Some(RoomName::new("protocol-42")));
    }

    #[test]
    fn test_change_target_missing_fields() {
        assert_eq!(change_target(&json!({"documentType": "protocol"})), None);
        assert_eq!(change_target(&json!({"documentId": "42"})), None);
        assert_eq!(change_target(&json!("just a string")), None);
    }

    #[test]
    fn test_message_target() {
        assert_eq!(
            message_target(&json!({"receiverId": "B", "text": "hi"})),
            Some(RoomName::new("B"))
        );
        assert_eq!(message_target(&json!({"text": "hi"})), None);
    }
}
