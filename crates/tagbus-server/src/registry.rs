//! Driver registry.
//!
//! Loads the built-in and configured drivers, keeps the item → tags fan-out
//! table, routes writes by binding and tracks per-driver started state in a
//! `sys.driver.<id>.started` tag.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tagbus_core::config::DriverDef;
use tagbus_core::{
    Driver, DriverBinding, DriverError, DriverInfo, ItemEvent, ItemSink, LoadError, LookupError,
    TagStore,
};
use tagbus_drivers::{
    is_builtin_id, is_builtin_uri, MemDriver, SimDriver, SysDriver, SysHandle, MEM_DRIVER_ID,
    MEM_DRIVER_URI, SIM_DRIVER_ID, SIM_DRIVER_URI, SYS_DRIVER_ID, SYS_DRIVER_URI,
};

/// Builds a driver from its `config` section.
pub type DriverFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Driver>, DriverError> + Send + Sync>;

/// Driver implementations available to configuration, keyed by `uri`.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: HashMap<String, DriverFactory>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, uri: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Driver>, DriverError> + Send + Sync + 'static,
    {
        self.factories.insert(uri.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.factories.contains_key(uri)
    }

    fn create(&self, id: &str, def: &DriverDef) -> Result<Box<dyn Driver>, LoadError> {
        let factory = self
            .factories
            .get(&def.uri)
            .ok_or_else(|| LoadError::UnknownDriverKind {
                id: id.to_string(),
                uri: def.uri.clone(),
            })?;
        factory(&def.config).map_err(|source| LoadError::DriverInit {
            id: id.to_string(),
            source,
        })
    }
}

impl fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut uris: Vec<&String> = self.factories.keys().collect();
        uris.sort();
        f.debug_struct("DriverCatalog").field("uris", &uris).finish()
    }
}

struct LoadedDriver {
    uri: String,
    driver: Box<dyn Driver>,
    started: bool,
    /// item → ids of the tags bound to it
    items: HashMap<String, Vec<String>>,
}

/// Tag id carrying the started state of a driver.
pub fn started_tag_id(driver_id: &str) -> String {
    format!("sys.driver.{driver_id}.started")
}

/// Owner of every loaded driver.
pub struct DriverRegistry {
    drivers: BTreeMap<String, LoadedDriver>,
    sys: SysHandle,
}

impl DriverRegistry {
    /// Load the built-in drivers followed by the configured ones.
    ///
    /// Every driver reports item changes through `emit`.
    pub fn load<F>(
        defs: &BTreeMap<String, DriverDef>,
        catalog: &DriverCatalog,
        emit: F,
    ) -> Result<Self, LoadError>
    where
        F: Fn(ItemEvent) + Send + Sync + Clone + 'static,
    {
        let sys_driver = SysDriver::new();
        let mut registry = Self {
            drivers: BTreeMap::new(),
            sys: sys_driver.handle(),
        };

        registry.insert(SYS_DRIVER_ID, SYS_DRIVER_URI, Box::new(sys_driver), &emit);
        registry.insert(SIM_DRIVER_ID, SIM_DRIVER_URI, Box::new(SimDriver::new()), &emit);
        registry.insert(MEM_DRIVER_ID, MEM_DRIVER_URI, Box::new(MemDriver::new()), &emit);

        for (id, def) in defs {
            if is_builtin_id(id) {
                return Err(LoadError::ReservedDriverId(id.clone()));
            }
            if is_builtin_uri(&def.uri) {
                return Err(LoadError::ReservedDriverUri {
                    id: id.clone(),
                    uri: def.uri.clone(),
                });
            }
            let driver = catalog.create(id, def)?;
            registry.insert(id, &def.uri, driver, &emit);
        }

        debug!("Loaded {} drivers", registry.drivers.len());
        Ok(registry)
    }

    fn insert<F>(&mut self, id: &str, uri: &str, mut driver: Box<dyn Driver>, emit: &F)
    where
        F: Fn(ItemEvent) + Send + Sync + Clone + 'static,
    {
        driver.attach(ItemSink::new(id, emit.clone()));
        self.drivers.insert(
            id.to_string(),
            LoadedDriver {
                uri: uri.to_string(),
                driver,
                started: false,
                items: HashMap::new(),
            },
        );
    }

    /// Create the `sys.driver.<id>.started` tag of every driver.
    pub fn create_system_tags(&mut self, store: &mut TagStore) -> Result<(), LoadError> {
        let ids: Vec<String> = self.drivers.keys().cloned().collect();
        for id in ids {
            let tag_id = started_tag_id(&id);
            self.sys.set(&tag_id, Value::Bool(false));
            store.create_system_tag(
                &tag_id,
                Value::Bool(false),
                DriverBinding::new(SYS_DRIVER_ID, tag_id.clone()),
            )?;
        }
        Ok(())
    }

    fn driver_mut(&mut self, id: &str) -> Result<&mut LoadedDriver, LookupError> {
        self.drivers
            .get_mut(id)
            .ok_or_else(|| LookupError::UnknownDriver(id.to_string()))
    }

    /// Bind a tag to a driver item.
    ///
    /// The item is registered with its driver and the tag appended to the
    /// item's fan-out list. The caller schedules the seed read.
    pub fn subscribe(&mut self, tag_id: &str, binding: &DriverBinding) -> Result<(), LookupError> {
        let loaded = self.driver_mut(&binding.id)?;
        loaded.driver.register(&binding.item);
        let tags = loaded.items.entry(binding.item.clone()).or_default();
        if !tags.iter().any(|t| t == tag_id) {
            tags.push(tag_id.to_string());
        }
        debug!("Tag {} bound to {}", tag_id, binding);
        Ok(())
    }

    /// Ids of the tags bound to a driver item, in binding order.
    pub fn tags_for_item(&self, event: &ItemEvent) -> &[String] {
        self.drivers
            .get(&event.driver_id)
            .and_then(|d| d.items.get(&event.item))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn read_item(&self, binding: &DriverBinding) -> Result<Option<Value>, LookupError> {
        let loaded = self
            .drivers
            .get(&binding.id)
            .ok_or_else(|| LookupError::UnknownDriver(binding.id.clone()))?;
        Ok(loaded.driver.read_item(&binding.item))
    }

    /// Forward a raw value to the driver owning `binding`.
    pub fn write_item(
        &mut self,
        binding: &DriverBinding,
        value: Value,
    ) -> Result<bool, LookupError> {
        let loaded = self.driver_mut(&binding.id)?;
        let accepted = loaded.driver.write_item(&binding.item, value);
        if !accepted {
            warn!("Driver rejected write to {}", binding);
        }
        Ok(accepted)
    }

    /// Start one driver, or all of them when `id` is `None`.
    pub fn start(&mut self, id: Option<&str>) -> Result<(), LookupError> {
        self.set_running(id, true)
    }

    /// Stop one driver, or all of them when `id` is `None`.
    pub fn stop(&mut self, id: Option<&str>) -> Result<(), LookupError> {
        self.set_running(id, false)
    }

    fn set_running(&mut self, id: Option<&str>, running: bool) -> Result<(), LookupError> {
        let ids: Vec<String> = match id {
            Some(id) => {
                self.driver_mut(id)?;
                vec![id.to_string()]
            }
            None => self.drivers.keys().cloned().collect(),
        };

        for id in ids {
            let Some(loaded) = self.drivers.get_mut(&id) else {
                continue;
            };
            if loaded.started == running {
                continue;
            }
            if running {
                loaded.driver.start();
                info!("Driver {} started", id);
            } else {
                loaded.driver.stop();
                info!("Driver {} stopped", id);
            }
            loaded.started = running;
            self.sys.set(&started_tag_id(&id), Value::Bool(running));
        }
        Ok(())
    }

    pub fn is_started(&self, id: &str) -> Option<bool> {
        self.drivers.get(id).map(|d| d.started)
    }

    pub fn info(&self) -> Vec<DriverInfo> {
        self.drivers
            .iter()
            .map(|(id, d)| DriverInfo {
                id: id.clone(),
                uri: d.uri.clone(),
                started: d.started,
            })
            .collect()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Driver that records writes and can be told to reject them.
    struct FakeDriver {
        registered: Arc<Mutex<Vec<String>>>,
        accept: bool,
    }

    impl Driver for FakeDriver {
        fn attach(&mut self, _sink: ItemSink) {}
        fn register(&mut self, item: &str) {
            self.registered.lock().unwrap().push(item.to_string());
        }
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn read_item(&self, item: &str) -> Option<Value> {
            Some(json!(item.len()))
        }
        fn write_item(&mut self, _item: &str, _value: Value) -> bool {
            self.accept
        }
    }

    fn defs(entries: &[(&str, &str)]) -> BTreeMap<String, DriverDef> {
        entries
            .iter()
            .map(|(id, uri)| {
                (
                    id.to_string(),
                    DriverDef {
                        uri: uri.to_string(),
                        config: Value::Null,
                    },
                )
            })
            .collect()
    }

    fn catalog(registered: Arc<Mutex<Vec<String>>>) -> DriverCatalog {
        let mut catalog = DriverCatalog::new();
        catalog.register("fake", move |config| {
            Ok(Box::new(FakeDriver {
                registered: registered.clone(),
                accept: config.get("readOnly").is_none(),
            }) as Box<dyn Driver>)
        });
        catalog
    }

    #[test]
    fn test_builtins_always_loaded() {
        let registry = DriverRegistry::load(&BTreeMap::new(), &DriverCatalog::new(), |_| {}).unwrap();
        let ids: Vec<String> = registry.info().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["mem", "sim", "sys"]);
    }

    #[test]
    fn test_reserved_id_and_uri_rejected() {
        let registered = Arc::new(Mutex::new(Vec::new()));
        let err = DriverRegistry::load(&defs(&[("sim", "fake")]), &catalog(registered.clone()), |_| {})
            .unwrap_err();
        assert!(matches!(err, LoadError::ReservedDriverId(id) if id == "sim"));

        let err = DriverRegistry::load(&defs(&[("plc1", "builtin:mem")]), &catalog(registered), |_| {})
            .unwrap_err();
        assert!(matches!(err, LoadError::ReservedDriverUri { .. }));
    }

    #[test]
    fn test_unknown_uri_rejected() {
        let err = DriverRegistry::load(&defs(&[("plc1", "modbus")]), &DriverCatalog::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, LoadError::UnknownDriverKind { .. }));
    }

    #[test]
    fn test_subscribe_builds_fan_out() {
        let registered = Arc::new(Mutex::new(Vec::new()));
        let mut registry =
            DriverRegistry::load(&defs(&[("plc1", "fake")]), &catalog(registered.clone()), |_| {})
                .unwrap();
        let binding = DriverBinding::new("plc1", "40001");

        registry.subscribe("a", &binding).unwrap();
        registry.subscribe("b", &binding).unwrap();
        registry.subscribe("a", &binding).unwrap();

        let event = ItemEvent {
            driver_id: "plc1".to_string(),
            item: "40001".to_string(),
            value: json!(1),
        };
        assert_eq!(registry.tags_for_item(&event), ["a", "b"]);
        assert_eq!(registered.lock().unwrap().len(), 3);
        assert_eq!(registry.read_item(&binding).unwrap(), Some(json!(5)));

        let missing = DriverBinding::new("plc9", "1");
        assert_eq!(
            registry.subscribe("c", &missing),
            Err(LookupError::UnknownDriver("plc9".to_string()))
        );
    }

    #[test]
    fn test_write_routing_reports_rejection() {
        let registered = Arc::new(Mutex::new(Vec::new()));
        let mut driver_defs = defs(&[("plc1", "fake"), ("plc2", "fake")]);
        if let Some(def) = driver_defs.get_mut("plc2") {
            def.config = json!({"readOnly": true});
        }
        let mut registry = DriverRegistry::load(&driver_defs, &catalog(registered), |_| {}).unwrap();

        assert_eq!(registry.write_item(&DriverBinding::new("plc1", "1"), json!(1)), Ok(true));
        assert_eq!(registry.write_item(&DriverBinding::new("plc2", "1"), json!(1)), Ok(false));
    }

    #[test]
    fn test_start_stop_tracks_system_tags() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let mut registry = DriverRegistry::load(&BTreeMap::new(), &DriverCatalog::new(), move |e| {
            events_clone.lock().unwrap().push(e)
        })
        .unwrap();
        let mut store = TagStore::new();
        registry.create_system_tags(&mut store).unwrap();
        assert!(store.contains("sys.driver.mem.started"));

        registry.start(Some("mem")).unwrap();
        registry.start(Some("mem")).unwrap();
        assert_eq!(registry.is_started("mem"), Some(true));
        assert_eq!(registry.is_started("sys"), Some(false));

        let started: Vec<ItemEvent> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.value == json!(true))
            .cloned()
            .collect();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].driver_id, "sys");
        assert_eq!(started[0].item, "sys.driver.mem.started");

        assert_eq!(
            registry.stop(Some("plc1")),
            Err(LookupError::UnknownDriver("plc1".to_string()))
        );
    }
}
