//! # tagbus-core
//!
//! Core tag bus data model and tag store.
//!
//! This crate provides:
//! - Data model types (TagChanged, DriverBinding, handles and ids)
//! - Telemetry/engineering value coercion
//! - Tag id matching for exact, wildcard and regex subscriptions
//! - The in-memory tag store with debounced updates and periodic calcs
//! - Project configuration types
//! - The driver adapter contract
//!
//! This crate is intentionally runtime-agnostic and contains no async code.

pub mod coerce;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod pattern;
pub mod store;

pub use coerce::{values_equal, AnalogTransform, DiscreteState, ValueInfo};
pub use config::{FunctionTable, ProjectConfig};
pub use driver::{Driver, ItemSink};
pub use error::{BusError, CalcError, CoercionError, DriverError, LoadError, LookupError};
pub use model::*;
pub use pattern::{PatternError, TagMatcher};
pub use store::{panic_message, CalcContext, CalcFn, PeriodicCalc, Tag, TagStore, SYSTEM_TAG_PREFIX};
