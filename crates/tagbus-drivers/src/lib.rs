//! # tagbus-drivers
//!
//! Built-in drivers for the tag bus.
//!
//! Every bus loads these three drivers before any configured driver. Their
//! ids and `builtin:` locations are reserved:
//! - `sys`: internally generated system objects (read-only)
//! - `sim`: simulated values driven by per-item timers
//! - `mem`: in-memory items

pub mod mem;
pub mod sim;
pub mod sys;

use std::sync::{Mutex, MutexGuard};

pub use mem::MemDriver;
pub use sim::SimDriver;
pub use sys::{SysDriver, SysHandle};

pub const SYS_DRIVER_ID: &str = "sys";
pub const SIM_DRIVER_ID: &str = "sim";
pub const MEM_DRIVER_ID: &str = "mem";

pub const SYS_DRIVER_URI: &str = "builtin:sys";
pub const SIM_DRIVER_URI: &str = "builtin:sim";
pub const MEM_DRIVER_URI: &str = "builtin:mem";

/// `(id, uri)` of every built-in driver, in load order.
pub const BUILTIN_DRIVERS: &[(&str, &str)] = &[
    (SYS_DRIVER_ID, SYS_DRIVER_URI),
    (SIM_DRIVER_ID, SIM_DRIVER_URI),
    (MEM_DRIVER_ID, MEM_DRIVER_URI),
];

pub fn is_builtin_id(id: &str) -> bool {
    BUILTIN_DRIVERS.iter().any(|(builtin, _)| *builtin == id)
}

pub fn is_builtin_uri(uri: &str) -> bool {
    BUILTIN_DRIVERS.iter().any(|(_, builtin)| *builtin == uri)
}

/// Item maps are only touched in short critical sections; a poisoned lock
/// still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
