//! Driver adapter contract.
//!
//! A driver wraps one data source and exposes any number of named items.
//! The registry talks to drivers only through [`Driver`]; drivers talk back
//! only through the [`ItemSink`] attached to them once at load time.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::model::ItemEvent;

/// Capability contract every driver implements.
///
/// All methods are synchronous and must not block on I/O. Drivers that poll
/// a source do so on their own tasks and report through the attached sink.
pub trait Driver: Send {
    /// Attach the change stream. Called exactly once, before any other method.
    fn attach(&mut self, sink: ItemSink);

    /// Register interest in an item. Repeated registration is a no-op.
    fn register(&mut self, item: &str);

    fn start(&mut self);

    fn stop(&mut self);

    /// Current raw value of an item, or `None` when it is unknown.
    fn read_item(&self, item: &str) -> Option<Value>;

    /// Ask the driver to write a raw value. Returns false when rejected.
    fn write_item(&mut self, item: &str, value: Value) -> bool;
}

/// Non-blocking change stream from a driver back to the bus.
///
/// Drivers must only emit when an item's value actually changed.
#[derive(Clone)]
pub struct ItemSink {
    driver_id: Arc<str>,
    emit: Arc<dyn Fn(ItemEvent) + Send + Sync>,
}

impl ItemSink {
    pub fn new<F>(driver_id: &str, emit: F) -> Self
    where
        F: Fn(ItemEvent) + Send + Sync + 'static,
    {
        Self {
            driver_id: Arc::from(driver_id),
            emit: Arc::new(emit),
        }
    }

    /// A sink that drops everything.
    pub fn discard(driver_id: &str) -> Self {
        Self::new(driver_id, |_| {})
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Report a new value for `item`.
    pub fn emit(&self, item: &str, value: Value) {
        (self.emit)(ItemEvent {
            driver_id: self.driver_id.to_string(),
            item: item.to_string(),
            value,
        });
    }
}

impl fmt::Debug for ItemSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemSink")
            .field("driver_id", &self.driver_id)
            .finish()
    }
}
