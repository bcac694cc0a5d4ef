//! The bus event loop.
//!
//! One task owns the tag store, the driver registry and the subscription hub.
//! Everything that touches them, whether a client request, a driver item
//! event or a periodic calculation tick, arrives as a [`BusCommand`] on a
//! single queue and is processed in order. Deferred work (seed reads, replay,
//! pulse reverts) is put back on the same queue instead of running inside
//! the request that caused it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tagbus_core::{
    panic_message, BusError, ClientId, ConnectionKind, FunctionTable, ItemEvent, LoadError,
    LookupError, ProjectConfig, SubscriptionHandle, TagChanged, TagMatcher, TagStore,
};
use tagbus_protocol::AppCallResult;

use crate::registry::{DriverCatalog, DriverRegistry};
use crate::rpc::RpcTable;
use crate::subscription::{Delivery, SubscriptionHub};

/// Work items processed by the bus task.
#[derive(Debug)]
pub enum BusCommand {
    Connect {
        kind: ConnectionKind,
        reply: oneshot::Sender<ClientId>,
    },
    Subscribe {
        client: ClientId,
        tagid: String,
        delivery: Delivery,
        reply: oneshot::Sender<Option<SubscriptionHandle>>,
    },
    /// Deliver current values to a new subscription.
    Replay { handle: SubscriptionHandle },
    Unsubscribe {
        client: ClientId,
        handle: SubscriptionHandle,
        reply: oneshot::Sender<bool>,
    },
    Disconnect { client: ClientId },
    AppCall {
        name: String,
        data: Value,
        reply: oneshot::Sender<AppCallResult>,
    },
    /// A driver reported a new item value.
    ItemValue(ItemEvent),
    /// Read a newly bound tag's item to give it a starting value.
    SeedRead { tag: String },
    RunCalc { tag: String },
    WriteTag { tag: String, value: Value },
    Shutdown,
}

/// Cloneable sender side of the bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl BusHandle {
    /// Queue a command. Returns false when the bus is gone.
    pub fn send(&self, command: BusCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BusCommand,
    ) -> Result<T, BusError> {
        let (reply, response) = oneshot::channel();
        if !self.send(command(reply)) {
            return Err(BusError::Closed);
        }
        response.await.map_err(|_| BusError::Closed)
    }

    pub async fn connect(&self, kind: ConnectionKind) -> Result<ClientId, BusError> {
        self.request(|reply| BusCommand::Connect { kind, reply })
            .await
    }

    /// Subscribe to a tag id or pattern.
    ///
    /// Resolves to `None` when the matcher is invalid or selects no tag. The
    /// replay of current values is queued only after the handle has been
    /// handed back, so a subscriber always holds its handle first.
    pub async fn subscribe(
        &self,
        client: ClientId,
        tagid: &str,
        delivery: Delivery,
    ) -> Result<Option<SubscriptionHandle>, BusError> {
        let handle = self
            .request(|reply| BusCommand::Subscribe {
                client,
                tagid: tagid.to_string(),
                delivery,
                reply,
            })
            .await?;
        if let Some(handle) = handle {
            self.send(BusCommand::Replay { handle });
        }
        Ok(handle)
    }

    pub async fn unsubscribe(
        &self,
        client: ClientId,
        handle: SubscriptionHandle,
    ) -> Result<bool, BusError> {
        self.request(|reply| BusCommand::Unsubscribe {
            client,
            handle,
            reply,
        })
        .await
    }

    /// Drop a client and its subscriptions. Safe to call more than once.
    pub fn disconnect(&self, client: ClientId) {
        self.send(BusCommand::Disconnect { client });
    }

    pub async fn app_call(&self, name: &str, data: Value) -> AppCallResult {
        self.request(|reply| BusCommand::AppCall {
            name: name.to_string(),
            data,
            reply,
        })
        .await
        .unwrap_or_else(|e| AppCallResult::err(e.to_string()))
    }

    pub fn shutdown(&self) {
        self.send(BusCommand::Shutdown);
    }
}

/// State owned by the bus task. RPC calls receive it mutably.
pub struct BusState {
    store: TagStore,
    registry: DriverRegistry,
    hub: SubscriptionHub,
    rpc: RpcTable,
    handle: BusHandle,
}

impl BusState {
    pub fn store(&self) -> &TagStore {
        &self.store
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    /// Queue `command` after `delay`.
    pub fn schedule(&self, delay: Duration, command: BusCommand) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.send(command);
        });
    }

    /// Apply a raw value to a tag and fan out the change.
    pub fn set_tag_value(&mut self, id: &str, raw: Value) -> Result<bool, BusError> {
        match self.store.set_value(id, raw)? {
            Some(change) => {
                self.hub.dispatch(&change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write an engineering value to a tag.
    ///
    /// Bound tags forward the telemetry form to their driver and report
    /// whether it accepted; the tag itself changes when the driver reports
    /// back. Unbound tags are memory tags and change immediately.
    pub fn write_tag(&mut self, id: &str, value: Value) -> Result<bool, BusError> {
        let telemetry = self.store.coerce_value(id, &value)?;
        let binding = self.store.get(id).and_then(|t| t.binding().cloned());
        match binding {
            Some(binding) => Ok(self.registry.write_item(&binding, telemetry)?),
            None => {
                self.set_tag_value(id, telemetry)?;
                Ok(true)
            }
        }
    }

    pub fn start_driver(&mut self, id: Option<&str>) -> Result<(), BusError> {
        Ok(self.registry.start(id)?)
    }

    pub fn stop_driver(&mut self, id: Option<&str>) -> Result<(), BusError> {
        Ok(self.registry.stop(id)?)
    }

    fn subscribe(
        &mut self,
        client: ClientId,
        tagid: &str,
        delivery: Delivery,
    ) -> Option<SubscriptionHandle> {
        let matcher = match TagMatcher::parse(tagid) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!("Client {} subscribe to '{}' refused: {}", client, tagid, e);
                return None;
            }
        };
        if self.store.ids_matching(&matcher).is_empty() {
            warn!(
                "Client {} subscribe to '{}' refused: {}",
                client,
                tagid,
                LookupError::UnknownTag(tagid.to_string())
            );
            return None;
        }
        match self.hub.subscribe(client, matcher, delivery) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Client {} subscribe to '{}' refused: {}", client, tagid, e);
                None
            }
        }
    }

    fn replay(&self, handle: SubscriptionHandle) {
        let Some(matcher) = self.hub.matcher(handle) else {
            debug!("Subscription {} gone before replay", handle);
            return;
        };
        for id in self.store.ids_matching(matcher) {
            if let Some(value) = self.store.value(&id) {
                self.hub.deliver_to(handle, &TagChanged::new(id.as_str(), value.clone()));
            }
        }
    }

    fn item_value(&mut self, event: ItemEvent) {
        let tags = self.registry.tags_for_item(&event).to_vec();
        if tags.is_empty() {
            warn!(
                "Item {}/{} has no bound tags",
                event.driver_id, event.item
            );
            return;
        }
        for tag in tags {
            // Coercion failures are logged by the store and leave the tag as is.
            let _ = self.set_tag_value(&tag, event.value.clone());
        }
    }

    fn seed_read(&mut self, tag: &str) {
        let Some(binding) = self.store.get(tag).and_then(|t| t.binding().cloned()) else {
            return;
        };
        match self.registry.read_item(&binding) {
            Ok(Some(raw)) => {
                debug!("Seed value for {} from {}", tag, binding);
                let _ = self.set_tag_value(tag, raw);
            }
            Ok(None) => debug!("No seed value for {} from {}", tag, binding),
            Err(e) => warn!("Seed read for {} failed: {}", tag, e),
        }
    }

    fn run_calc(&mut self, tag: &str) {
        if let Ok(Some(change)) = self.store.run_calc(tag) {
            self.hub.dispatch(&change);
        }
    }

    fn app_call(&mut self, name: &str, data: Value) -> AppCallResult {
        let Some(call) = self.rpc.get(name) else {
            let err = LookupError::UnknownCall(name.to_string());
            warn!("app_call failed: {}", err);
            return AppCallResult::err(err.to_string());
        };
        match catch_unwind(AssertUnwindSafe(|| call(self, data))) {
            Ok(Ok(result)) => AppCallResult::ok(result),
            Ok(Err(e)) => {
                warn!("app_call {} failed: {}", name, e);
                AppCallResult::err(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("app_call {} panicked: {}", name, message);
                AppCallResult::err(format!("call {name} panicked: {message}"))
            }
        }
    }
}

/// The bus: its state plus the queue feeding it.
pub struct Bus {
    state: BusState,
    commands: mpsc::UnboundedReceiver<BusCommand>,
}

impl Bus {
    /// Build a bus from a project configuration.
    ///
    /// Loads drivers and tags, creates the system tags, binds every tag to
    /// its driver item and queues the seed reads. Nothing runs until
    /// [`Bus::run`].
    pub fn load(
        config: &ProjectConfig,
        functions: &FunctionTable,
        catalog: &DriverCatalog,
        rpc: RpcTable,
    ) -> Result<Self, LoadError> {
        let (tx, commands) = mpsc::unbounded_channel();
        let handle = BusHandle { tx: tx.clone() };

        let mut registry = DriverRegistry::load(&config.drivers, catalog, move |event| {
            let _ = tx.send(BusCommand::ItemValue(event));
        })?;

        let mut store = TagStore::new();
        store.load(&config.tags, functions)?;
        registry.create_system_tags(&mut store)?;

        for (tag, binding) in store.bindings() {
            match registry.subscribe(&tag, &binding) {
                Ok(()) => {
                    handle.send(BusCommand::SeedRead { tag });
                }
                Err(e) => error!("Tag {} left unbound: {}", tag, e),
            }
        }

        info!(
            "Bus loaded {} tags and {} drivers",
            store.len(),
            registry.info().len()
        );

        Ok(Self {
            state: BusState {
                store,
                registry,
                hub: SubscriptionHub::new(),
                rpc,
                handle,
            },
            commands,
        })
    }

    pub fn handle(&self) -> BusHandle {
        self.state.handle.clone()
    }

    pub fn state(&self) -> &BusState {
        &self.state
    }

    /// Run on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Start every driver and process commands until shutdown.
    pub async fn run(mut self) {
        if let Err(e) = self.state.start_driver(None) {
            error!("Failed to start drivers: {}", e);
        }
        let calcs = self.spawn_calcs();

        while let Some(command) = self.commands.recv().await {
            if !self.process(command) {
                break;
            }
        }

        for task in calcs {
            task.abort();
        }
        if let Err(e) = self.state.stop_driver(None) {
            error!("Failed to stop drivers: {}", e);
        }
        info!("Bus stopped");
    }

    fn spawn_calcs(&self) -> Vec<JoinHandle<()>> {
        self.state
            .store
            .calc_schedule()
            .into_iter()
            .map(|(tag, interval)| {
                let handle = self.state.handle.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if !handle.send(BusCommand::RunCalc { tag: tag.clone() }) {
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    /// Handle one command. Returns false on shutdown.
    fn process(&mut self, command: BusCommand) -> bool {
        let state = &mut self.state;
        match command {
            BusCommand::Connect { kind, reply } => {
                let _ = reply.send(state.hub.connect(kind));
            }
            BusCommand::Subscribe {
                client,
                tagid,
                delivery,
                reply,
            } => {
                let _ = reply.send(state.subscribe(client, &tagid, delivery));
            }
            BusCommand::Replay { handle } => state.replay(handle),
            BusCommand::Unsubscribe {
                client,
                handle,
                reply,
            } => {
                let _ = reply.send(state.hub.unsubscribe(client, handle));
            }
            BusCommand::Disconnect { client } => {
                state.hub.disconnect(client);
            }
            BusCommand::AppCall { name, data, reply } => {
                let _ = reply.send(state.app_call(&name, data));
            }
            BusCommand::ItemValue(event) => state.item_value(event),
            BusCommand::SeedRead { tag } => state.seed_read(&tag),
            BusCommand::RunCalc { tag } => state.run_calc(&tag),
            BusCommand::WriteTag { tag, value } => {
                if let Err(e) = state.write_tag(&tag, value) {
                    warn!("Deferred write to {} failed: {}", tag, e);
                }
            }
            BusCommand::Shutdown => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(json: Value) -> ProjectConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_load_queues_seed_reads() {
        let config = project(json!({
            "tags": {
                "press1": {"defaultValue": 0, "driverinfo": {"id": "mem", "item": "p1"}},
                "local": {"defaultValue": 1}
            }
        }));
        let mut bus = Bus::load(&config, &FunctionTable::new(), &DriverCatalog::new(), RpcTable::new())
            .unwrap();

        let mut seeded = Vec::new();
        while let Ok(command) = bus.commands.try_recv() {
            if let BusCommand::SeedRead { tag } = command {
                seeded.push(tag);
            }
        }
        assert!(seeded.contains(&"press1".to_string()));
        assert!(seeded.contains(&"sys.driver.mem.started".to_string()));
        assert!(!seeded.contains(&"local".to_string()));
    }

    #[test]
    fn test_load_rejects_reserved_driver() {
        let config = project(json!({
            "drivers": {"sim": {"uri": "anything"}}
        }));
        let err = Bus::load(&config, &FunctionTable::new(), &DriverCatalog::new(), RpcTable::new())
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::ReservedDriverId(_)));
    }

    #[tokio::test]
    async fn test_memory_tag_write_goes_through_coercion() {
        let config = project(json!({
            "tags": {
                "pump1.status": {
                    "defaultValue": "NORMAL",
                    "valueInfo": {"type": "discrete", "states": [
                        {"value": 0, "state": "NORMAL"},
                        {"value": 1, "state": "ALARM"}
                    ]}
                }
            }
        }));
        let mut bus = Bus::load(&config, &FunctionTable::new(), &DriverCatalog::new(), RpcTable::new())
            .unwrap();

        assert_eq!(bus.state.write_tag("pump1.status", json!("ALARM")).unwrap(), true);
        assert_eq!(bus.state.store().value("pump1.status"), Some(&json!("ALARM")));
        assert!(bus.state.write_tag("pump1.status", json!("BROKEN")).is_err());
        assert_eq!(bus.state.store().value("pump1.status"), Some(&json!("ALARM")));
    }
}
