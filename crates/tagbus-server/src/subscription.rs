//! Subscription fan-out.
//!
//! The hub owns every client and subscription of one bus. Subscriptions are
//! indexed so that dispatching a change only looks at candidates:
//! - exact ids by tag id
//! - wildcard patterns by their literal prefix
//! - regular expressions in a short list checked one by one

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tagbus_core::pattern::id_prefixes;
use tagbus_core::{
    panic_message, BusError, ClientId, ConnectionKind, SubscriptionHandle, TagChanged, TagMatcher,
};

/// Callback of an in-process subscriber.
pub type TagCallback = Arc<dyn Fn(&TagChanged) + Send + Sync>;

/// Where a subscription's changes go.
#[derive(Clone)]
pub enum Delivery {
    /// Network client; the connection task forwards changes to its socket.
    Channel(mpsc::UnboundedSender<TagChanged>),
    /// In-process client; called on the bus task.
    Callback(TagCallback),
}

impl Delivery {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&TagChanged) + Send + Sync + 'static,
    {
        Delivery::Callback(Arc::new(f))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Channel(_) => f.write_str("Channel"),
            Delivery::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct Subscription {
    client: ClientId,
    matcher: TagMatcher,
    delivery: Delivery,
}

#[derive(Debug)]
struct ClientEntry {
    kind: ConnectionKind,
    handles: Vec<SubscriptionHandle>,
}

/// Per-bus registry of clients and their subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionHub {
    clients: HashMap<ClientId, ClientEntry>,
    subscriptions: HashMap<SubscriptionHandle, Subscription>,
    by_id: HashMap<String, Vec<SubscriptionHandle>>,
    by_prefix: HashMap<String, Vec<SubscriptionHandle>>,
    regexes: Vec<SubscriptionHandle>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, kind: ConnectionKind) -> ClientId {
        let id = ClientId::new();
        info!("Client {} connected ({})", id, kind);
        self.clients.insert(
            id,
            ClientEntry {
                kind,
                handles: Vec::new(),
            },
        );
        id
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Add a subscription for a connected client.
    ///
    /// Replay of current values is the caller's job; see
    /// [`SubscriptionHub::deliver_to`].
    pub fn subscribe(
        &mut self,
        client: ClientId,
        matcher: TagMatcher,
        delivery: Delivery,
    ) -> Result<SubscriptionHandle, BusError> {
        let entry = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| BusError::InvalidRequest(format!("client {client} is not connected")))?;

        let handle = SubscriptionHandle::new();
        entry.handles.push(handle);

        match &matcher {
            TagMatcher::Exact(id) => self.by_id.entry(id.clone()).or_default().push(handle),
            TagMatcher::Wildcard(pattern) => self
                .by_prefix
                .entry(pattern.literal_prefix())
                .or_default()
                .push(handle),
            TagMatcher::Regex(_) => self.regexes.push(handle),
        }

        debug!(
            "Client {} subscribed to {} as {}",
            client,
            matcher.to_source(),
            handle
        );
        self.subscriptions.insert(
            handle,
            Subscription {
                client,
                matcher,
                delivery,
            },
        );
        Ok(handle)
    }

    /// Remove one of a client's subscriptions. Unknown handles are ignored.
    pub fn unsubscribe(&mut self, client: ClientId, handle: SubscriptionHandle) -> bool {
        match self.subscriptions.get(&handle) {
            Some(sub) if sub.client == client => {}
            _ => return false,
        }
        self.remove(handle);
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.handles.retain(|h| *h != handle);
        }
        debug!("Client {} unsubscribed {}", client, handle);
        true
    }

    /// Drop a client and all of its subscriptions. Repeated calls are no-ops.
    pub fn disconnect(&mut self, client: ClientId) -> usize {
        let Some(entry) = self.clients.remove(&client) else {
            return 0;
        };
        for handle in &entry.handles {
            self.remove(*handle);
        }
        info!(
            "Client {} disconnected ({}), {} subscriptions removed",
            client,
            entry.kind,
            entry.handles.len()
        );
        entry.handles.len()
    }

    fn remove(&mut self, handle: SubscriptionHandle) {
        let Some(sub) = self.subscriptions.remove(&handle) else {
            return;
        };
        match &sub.matcher {
            TagMatcher::Exact(id) => remove_indexed(&mut self.by_id, id, handle),
            TagMatcher::Wildcard(pattern) => {
                remove_indexed(&mut self.by_prefix, &pattern.literal_prefix(), handle)
            }
            TagMatcher::Regex(_) => self.regexes.retain(|h| *h != handle),
        }
    }

    /// Handles of every subscription whose matcher selects `tag_id`.
    pub fn matching(&self, tag_id: &str) -> Vec<SubscriptionHandle> {
        let mut found: Vec<SubscriptionHandle> = Vec::new();
        if let Some(handles) = self.by_id.get(tag_id) {
            found.extend(handles);
        }
        for prefix in id_prefixes(tag_id) {
            if let Some(handles) = self.by_prefix.get(prefix) {
                found.extend(handles.iter().filter(|h| self.selects(h, tag_id)));
            }
        }
        found.extend(self.regexes.iter().filter(|h| self.selects(h, tag_id)));
        found
    }

    fn selects(&self, handle: &SubscriptionHandle, tag_id: &str) -> bool {
        self.subscriptions
            .get(handle)
            .is_some_and(|s| s.matcher.matches(tag_id))
    }

    /// The matcher of a live subscription.
    pub fn matcher(&self, handle: SubscriptionHandle) -> Option<&TagMatcher> {
        self.subscriptions.get(&handle).map(|s| &s.matcher)
    }

    /// Deliver a change to every matching subscription.
    ///
    /// A channel receives a change at most once even when several of the
    /// subscriptions feeding it match. Returns the number of deliveries made.
    pub fn dispatch(&self, change: &TagChanged) -> usize {
        let mut channels: Vec<&mpsc::UnboundedSender<TagChanged>> = Vec::new();
        let mut delivered = 0;
        for handle in self.matching(&change.id) {
            let Some(sub) = self.subscriptions.get(&handle) else {
                continue;
            };
            if let Delivery::Channel(tx) = &sub.delivery {
                if channels.iter().any(|seen| seen.same_channel(tx)) {
                    continue;
                }
                channels.push(tx);
            }
            if deliver(handle, &sub.delivery, change) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a change to one subscription. Returns false when it is gone.
    pub fn deliver_to(&self, handle: SubscriptionHandle, change: &TagChanged) -> bool {
        match self.subscriptions.get(&handle) {
            Some(sub) => deliver(handle, &sub.delivery, change),
            None => false,
        }
    }
}

fn remove_indexed(
    index: &mut HashMap<String, Vec<SubscriptionHandle>>,
    key: &str,
    handle: SubscriptionHandle,
) {
    if let Some(handles) = index.get_mut(key) {
        handles.retain(|h| *h != handle);
        if handles.is_empty() {
            index.remove(key);
        }
    }
}

/// Hand a change to one subscriber; failures stay with that subscriber.
fn deliver(handle: SubscriptionHandle, delivery: &Delivery, change: &TagChanged) -> bool {
    match delivery {
        Delivery::Channel(tx) => {
            if tx.send(change.clone()).is_err() {
                warn!("Delivery channel of {} is closed", handle);
                return false;
            }
            true
        }
        Delivery::Callback(callback) => {
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(()) => true,
                Err(panic) => {
                    error!(
                        "Subscriber {} panicked on {}: {}",
                        handle,
                        change.id,
                        panic_message(panic.as_ref())
                    );
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn in_process() -> ConnectionKind {
        ConnectionKind::InProcess {
            name: "test".to_string(),
        }
    }

    fn recorder() -> (Delivery, Arc<Mutex<Vec<TagChanged>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let delivery = Delivery::callback(move |c| seen_clone.lock().unwrap().push(c.clone()));
        (delivery, seen)
    }

    #[test]
    fn test_exact_wildcard_and_regex_matching() {
        let mut hub = SubscriptionHub::new();
        let client = hub.connect(in_process());
        let (delivery, _) = recorder();

        let exact = hub
            .subscribe(client, TagMatcher::parse("pump1.status").unwrap(), delivery.clone())
            .unwrap();
        let wildcard = hub
            .subscribe(client, TagMatcher::parse("pump1.*").unwrap(), delivery.clone())
            .unwrap();
        let everything = hub
            .subscribe(client, TagMatcher::parse("*").unwrap(), delivery.clone())
            .unwrap();
        let regex = hub
            .subscribe(client, TagMatcher::parse("/^pump\\d\\.status$/").unwrap(), delivery)
            .unwrap();

        let mut found = hub.matching("pump1.status");
        found.sort();
        let mut expected = vec![exact, wildcard, everything, regex];
        expected.sort();
        assert_eq!(found, expected);

        assert_eq!(hub.matching("tank.level"), vec![everything]);
    }

    #[test]
    fn test_dispatch_reaches_callbacks() {
        let mut hub = SubscriptionHub::new();
        let client = hub.connect(in_process());
        let (delivery, seen) = recorder();
        hub.subscribe(client, TagMatcher::exact("press1"), delivery).unwrap();

        let change = TagChanged::new("press1", json!(42));
        assert_eq!(hub.dispatch(&change), 1);
        assert_eq!(hub.dispatch(&TagChanged::new("press2", json!(1))), 0);
        assert_eq!(*seen.lock().unwrap(), vec![change]);
    }

    #[test]
    fn test_failing_callback_does_not_block_others() {
        let mut hub = SubscriptionHub::new();
        let bad = hub.connect(in_process());
        let good = hub.connect(in_process());
        hub.subscribe(
            bad,
            TagMatcher::exact("press1"),
            Delivery::callback(|_| panic!("subscriber failure")),
        )
        .unwrap();
        let (delivery, seen) = recorder();
        hub.subscribe(good, TagMatcher::exact("press1"), delivery).unwrap();

        hub.dispatch(&TagChanged::new("press1", json!(1)));
        hub.dispatch(&TagChanged::new("press1", json!(2)));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_channel_gets_one_copy_per_change() {
        let mut hub = SubscriptionHub::new();
        let client = hub.connect(ConnectionKind::Remote {
            peer: "127.0.0.1:9".to_string(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(client, TagMatcher::exact("pump1.press"), Delivery::Channel(tx.clone()))
            .unwrap();
        hub.subscribe(client, TagMatcher::parse("pump1.*").unwrap(), Delivery::Channel(tx.clone()))
            .unwrap();
        hub.subscribe(client, TagMatcher::parse("/press$/").unwrap(), Delivery::Channel(tx))
            .unwrap();

        let change = TagChanged::new("pump1.press", json!(3));
        assert_eq!(hub.matching("pump1.press").len(), 3);
        assert_eq!(hub.dispatch(&change), 1);
        assert_eq!(rx.try_recv().unwrap(), change);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_isolated() {
        let mut hub = SubscriptionHub::new();
        let gone = hub.connect(in_process());
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);
        hub.subscribe(gone, TagMatcher::exact("press1"), Delivery::Channel(closed_tx))
            .unwrap();
        let live = hub.connect(in_process());
        let (delivery, seen) = recorder();
        hub.subscribe(live, TagMatcher::exact("press1"), delivery).unwrap();

        assert_eq!(hub.dispatch(&TagChanged::new("press1", json!(1))), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_and_disconnect() {
        let mut hub = SubscriptionHub::new();
        let client = hub.connect(in_process());
        let other = hub.connect(in_process());
        let (delivery, seen) = recorder();

        let a = hub
            .subscribe(client, TagMatcher::exact("press1"), delivery.clone())
            .unwrap();
        hub.subscribe(client, TagMatcher::parse("tank.*").unwrap(), delivery.clone())
            .unwrap();

        assert!(!hub.unsubscribe(other, a));
        assert!(hub.unsubscribe(client, a));
        assert!(!hub.unsubscribe(client, a));
        assert_eq!(hub.dispatch(&TagChanged::new("press1", json!(1))), 0);

        assert_eq!(hub.disconnect(client), 1);
        assert_eq!(hub.disconnect(client), 0);
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(hub.dispatch(&TagChanged::new("tank.level", json!(1))), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert!(hub
            .subscribe(client, TagMatcher::exact("press1"), delivery)
            .is_err());
    }
}
