//! Memory driver.
//!
//! Hosts items that only live in memory. Tags may bind to it explicitly with
//! driver id `mem`; a registered item stays unknown until the first write.

use serde_json::Value;
use std::collections::HashMap;
use tagbus_core::{values_equal, Driver, ItemSink};
use tracing::debug;

#[derive(Debug)]
pub struct MemDriver {
    items: HashMap<String, Option<Value>>,
    sink: ItemSink,
}

impl MemDriver {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            sink: ItemSink::discard(crate::MEM_DRIVER_ID),
        }
    }
}

impl Default for MemDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemDriver {
    fn attach(&mut self, sink: ItemSink) {
        self.sink = sink;
    }

    fn register(&mut self, item: &str) {
        self.items.entry(item.to_string()).or_insert(None);
    }

    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn read_item(&self, item: &str) -> Option<Value> {
        self.items.get(item).cloned().flatten()
    }

    fn write_item(&mut self, item: &str, value: Value) -> bool {
        let slot = self.items.entry(item.to_string()).or_insert(None);
        if slot.as_ref().is_some_and(|old| values_equal(old, &value)) {
            return true;
        }
        debug!("mem item {} = {}", item, value);
        *slot = Some(value.clone());
        self.sink.emit(item, value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn attached() -> (MemDriver, Arc<Mutex<Vec<(String, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut driver = MemDriver::new();
        driver.attach(ItemSink::new("mem", move |e| {
            seen_clone.lock().unwrap().push((e.item, e.value))
        }));
        (driver, seen)
    }

    #[test]
    fn test_register_leaves_item_unknown() {
        let (mut driver, _) = attached();
        driver.register("setpoint");
        driver.register("setpoint");
        assert_eq!(driver.read_item("setpoint"), None);
    }

    #[test]
    fn test_write_emits_only_on_change() {
        let (mut driver, seen) = attached();
        driver.register("setpoint");

        assert!(driver.write_item("setpoint", json!(5)));
        assert!(driver.write_item("setpoint", json!(5)));
        assert!(driver.write_item("setpoint", json!(6)));

        assert_eq!(driver.read_item("setpoint"), Some(json!(6)));
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("setpoint".to_string(), json!(5)),
                ("setpoint".to_string(), json!(6))
            ]
        );
    }
}
