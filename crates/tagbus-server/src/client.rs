//! In-process client.
//!
//! Embeds a subscriber in the host process. The contract matches a network
//! client except that changes arrive as direct callbacks on the bus task.

use serde_json::Value;
use tagbus_core::{BusError, ClientId, ConnectionKind, SubscriptionHandle, TagChanged};
use tagbus_protocol::AppCallResult;

use crate::bus::BusHandle;
use crate::subscription::Delivery;

/// A client living in the same process as the bus.
///
/// Dropping the client disconnects it.
#[derive(Debug)]
pub struct LocalClient {
    id: ClientId,
    bus: BusHandle,
}

impl LocalClient {
    pub async fn connect(bus: &BusHandle, name: impl Into<String>) -> Result<Self, BusError> {
        let id = bus
            .connect(ConnectionKind::InProcess { name: name.into() })
            .await?;
        Ok(Self {
            id,
            bus: bus.clone(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Subscribe to a tag id or pattern.
    ///
    /// `callback` runs on the bus task and must not block. It first receives
    /// the current value of every matching tag, then every change.
    pub async fn subscribe<F>(
        &self,
        tagid: &str,
        callback: F,
    ) -> Result<Option<SubscriptionHandle>, BusError>
    where
        F: Fn(&TagChanged) + Send + Sync + 'static,
    {
        self.bus
            .subscribe(self.id, tagid, Delivery::callback(callback))
            .await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, BusError> {
        self.bus.unsubscribe(self.id, handle).await
    }

    pub async fn app_call(&self, name: &str, data: Value) -> AppCallResult {
        self.bus.app_call(name, data).await
    }

    pub fn disconnect(&self) {
        self.bus.disconnect(self.id);
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.bus.disconnect(self.id);
    }
}
