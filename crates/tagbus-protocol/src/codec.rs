//! WebSocket message codec for the tag bus protocol.
//!
//! Messages are JSON over WebSocket text frames.

use crate::messages::{ClientMessage, ServerMessage};
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Failed to serialize message: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,
}

/// Encode a server message to JSON string for WebSocket transmission.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a client message from JSON string received over WebSocket.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Encode a client message. Used by Rust clients and tests.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a server message. Used by Rust clients and tests.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AckMessage, HelloMessage};
    use tagbus_core::TagChanged;

    #[test]
    fn test_encode_hello() {
        let hello = HelloMessage::new("test", "0.1.0", "c1");
        let json = encode_server_message(&ServerMessage::Hello(hello)).unwrap();

        assert!(json.contains("\"event\":\"hello\""));
        assert!(json.contains("\"name\":\"test\""));
    }

    #[test]
    fn test_server_message_round_trip() {
        let msg = ServerMessage::tag_changed(&TagChanged::new("pump1.status", "ALARM".into()));
        let json = encode_server_message(&msg).unwrap();
        assert_eq!(decode_server_message(&json).unwrap(), msg);

        let ack = ServerMessage::Ack(AckMessage::unsubscribed(9, "h-1"));
        let json = encode_server_message(&ack).unwrap();
        assert_eq!(decode_server_message(&json).unwrap(), ack);
    }

    #[test]
    fn test_decode_unsubscribe() {
        let json = r#"{"op":"unsubscribeTag","tagid":"press1","handle":"abc","ackId":2}"#;
        match decode_client_message(json).unwrap() {
            ClientMessage::UnsubscribeTag {
                tagid,
                handle,
                ack_id,
            } => {
                assert_eq!(tagid, "press1");
                assert_eq!(handle, "abc");
                assert_eq!(ack_id, Some(2));
            }
            _ => panic!("Expected UnsubscribeTag"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_op() {
        assert!(decode_client_message(r#"{"op":"put","path":"x"}"#).is_err());
        assert!(decode_client_message("not json").is_err());
    }
}
