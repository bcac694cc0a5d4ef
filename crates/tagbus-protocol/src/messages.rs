//! Protocol message types for WebSocket communication.
//!
//! This module defines all message types exchanged over the tag bus WebSocket protocol:
//! - Server → Client: hello, ack, tagChanged
//! - Client → Server: subscribeTag, unsubscribeTag, app_call
//!
//! Any client message may carry an `ackId`. The server answers such a message
//! with exactly one `ack` carrying the same id, which gives the
//! request/acknowledge pairing of an emit-with-ack transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tagbus_core::{SubscriptionHandle, TagChanged};

// ============================================================================
// Client → Server
// ============================================================================

/// Messages that can be received from a client, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ClientMessage {
    /// Subscribe to a tag id, wildcard pattern or `/regex/`.
    ///
    /// Ack args: `[handle]`, or `[null]` when the subscription was refused.
    #[serde(rename = "subscribeTag")]
    SubscribeTag {
        tagid: String,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },

    /// Remove a subscription by handle. Ack args: `[handle]`.
    #[serde(rename = "unsubscribeTag")]
    UnsubscribeTag {
        tagid: String,
        handle: String,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },

    /// Invoke a named call. Ack args: `[result, error]`.
    #[serde(rename = "app_call")]
    AppCall {
        name: String,
        #[serde(default)]
        data: Value,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
}

impl ClientMessage {
    pub fn ack_id(&self) -> Option<u64> {
        match self {
            ClientMessage::SubscribeTag { ack_id, .. }
            | ClientMessage::UnsubscribeTag { ack_id, .. }
            | ClientMessage::AppCall { ack_id, .. } => *ack_id,
        }
    }
}

// ============================================================================
// Server → Client
// ============================================================================

/// Hello message sent by server immediately on WebSocket connection.
///
/// # Example
/// ```json
/// {
///   "event": "hello",
///   "name": "tagbus",
///   "version": "0.1.0",
///   "clientId": "0d4f4c8e-6a0b-4bd4-9c61-0b1c7d7b3e55",
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    /// Server name identifier.
    pub name: String,

    /// Server version.
    pub version: String,

    /// Id assigned to this connection.
    pub client_id: String,

    /// Current server timestamp in ISO 8601 format.
    pub timestamp: String,
}

impl HelloMessage {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            client_id: client_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Acknowledgement of a client message that carried an `ackId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub ack_id: u64,
    pub args: Vec<Value>,
}

impl AckMessage {
    /// Ack for `subscribeTag`: the handle, or null when refused.
    pub fn subscribed(ack_id: u64, handle: Option<SubscriptionHandle>) -> Self {
        Self {
            ack_id,
            args: vec![handle.map_or(Value::Null, |h| Value::String(h.to_string()))],
        }
    }

    /// Ack for `unsubscribeTag`: echoes the handle.
    pub fn unsubscribed(ack_id: u64, handle: &str) -> Self {
        Self {
            ack_id,
            args: vec![Value::String(handle.to_string())],
        }
    }

    /// Ack for `app_call`: `[result, error]`.
    pub fn call_result(ack_id: u64, result: &AppCallResult) -> Self {
        Self {
            ack_id,
            args: vec![
                result.result.clone(),
                result.error.clone().map_or(Value::Null, Value::String),
            ],
        }
    }
}

/// A tag change pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagChangedMessage {
    pub tagid: String,
    pub data: TagChanged,
}

/// Outcome of an `app_call`. Failed calls carry a null result and an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCallResult {
    pub result: Value,
    pub error: Option<String>,
}

impl AppCallResult {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Messages that can be sent from server to client, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "hello")]
    Hello(HelloMessage),

    #[serde(rename = "ack")]
    Ack(AckMessage),

    #[serde(rename = "tagChanged")]
    TagChanged(TagChangedMessage),
}

impl ServerMessage {
    pub fn tag_changed(change: &TagChanged) -> Self {
        ServerMessage::TagChanged(TagChangedMessage {
            tagid: change.id.clone(),
            data: change.clone(),
        })
    }
}

// ============================================================================
// Discovery Endpoint
// ============================================================================

/// Discovery response for the `/tagbus` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version: String,
    pub http: String,
    pub ws: String,
}

impl DiscoveryResponse {
    /// Create a discovery response for the given host.
    pub fn new(host: &str, http_port: u16, ws_port: u16) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            http: format!("http://{}:{}/api", host, http_port),
            ws: format!("ws://{}:{}/stream", host, ws_port),
        }
    }
}
