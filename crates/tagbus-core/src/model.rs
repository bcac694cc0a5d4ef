//! Tag bus data model types.
//!
//! These are the small value types shared by every layer:
//! - Change notifications carried from the tag store to subscribers
//! - Driver bindings linking a tag to a raw driver item
//! - Identifiers for clients and subscriptions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Links a tag to one item of one driver.
///
/// The item string is driver specific; the registry does not look inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverBinding {
    /// Driver id (e.g., "sim", "plc1")
    pub id: String,
    /// Driver specific item name (e.g., "randomInt:1000:0:0:100")
    pub item: String,
}

impl DriverBinding {
    pub fn new(id: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item: item.into(),
        }
    }
}

impl fmt::Display for DriverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.item)
    }
}

/// A tag changed to a new engineering value.
///
/// Serializes as the `{id, value}` payload sent with `tagChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagChanged {
    pub id: String,
    pub value: Value,
}

impl TagChanged {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Point-in-time view of one tag, as returned by `read_tag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSnapshot {
    pub id: String,
    pub value: Value,
    pub value_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driverinfo: Option<DriverBinding>,
}

/// Globally unique identifier handed back for every subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a client is attached to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConnectionKind {
    /// Network client; changes are emitted over its connection.
    Remote { peer: String },
    /// Embedded client; changes are delivered by direct callback.
    InProcess { name: String },
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Remote { peer } => write!(f, "remote {peer}"),
            ConnectionKind::InProcess { name } => write!(f, "in-process {name}"),
        }
    }
}

/// Summary of a loaded driver, as returned by `query_driver_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub id: String,
    pub uri: String,
    pub started: bool,
}

/// Item value reported by a driver through its change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEvent {
    pub driver_id: String,
    pub item: String,
    pub value: Value,
}
