//! System driver.
//!
//! Exposes objects generated by the bus itself, such as the started state of
//! every driver. Item names are the `sys.*` tag ids they feed. Values are set
//! through a [`SysHandle`]; writes from clients are rejected.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tagbus_core::{values_equal, Driver, ItemSink};
use tracing::warn;

use crate::lock;

#[derive(Debug, Default)]
struct SysItems {
    values: HashMap<String, Value>,
    sink: Option<ItemSink>,
}

#[derive(Debug, Default)]
pub struct SysDriver {
    inner: Arc<Mutex<SysItems>>,
}

/// Setter for system object values, held by the subsystem that owns them.
#[derive(Debug, Clone)]
pub struct SysHandle {
    inner: Arc<Mutex<SysItems>>,
}

impl SysDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SysHandle {
        SysHandle {
            inner: self.inner.clone(),
        }
    }
}

impl SysHandle {
    /// Set a system object, emitting it when the value changed.
    pub fn set(&self, item: &str, value: Value) {
        let sink = {
            let mut items = lock(&self.inner);
            if items
                .values
                .get(item)
                .is_some_and(|old| values_equal(old, &value))
            {
                return;
            }
            items.values.insert(item.to_string(), value.clone());
            items.sink.clone()
        };
        if let Some(sink) = sink {
            sink.emit(item, value);
        }
    }

    pub fn get(&self, item: &str) -> Option<Value> {
        lock(&self.inner).values.get(item).cloned()
    }
}

impl Driver for SysDriver {
    fn attach(&mut self, sink: ItemSink) {
        lock(&self.inner).sink = Some(sink);
    }

    fn register(&mut self, _item: &str) {}

    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn read_item(&self, item: &str) -> Option<Value> {
        lock(&self.inner).values.get(item).cloned()
    }

    fn write_item(&mut self, item: &str, _value: Value) -> bool {
        warn!("sys item {} is read-only", item);
        false
    }
}
