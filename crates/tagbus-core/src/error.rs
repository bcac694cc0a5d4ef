//! Error taxonomy for the tag bus.
//!
//! Errors fall into a small number of classes with different handling rules:
//! load errors are fatal at startup, lookup and coercion errors are returned
//! to the caller of a single request, and delivery errors stay isolated to
//! the subscriber that caused them.

use serde_json::Value;
use thiserror::Error;

use crate::pattern::PatternError;

/// Fatal configuration errors. The process must not start serving.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to parse project configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read project configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Driver id '{0}' is reserved for a built-in driver")]
    ReservedDriverId(String),

    #[error("Driver '{id}' uses '{uri}', which is loaded by default")]
    ReservedDriverUri { id: String, uri: String },

    #[error("Driver '{id}' has no implementation for '{uri}'")]
    UnknownDriverKind { id: String, uri: String },

    #[error("Driver '{id}' failed to initialize: {source}")]
    DriverInit {
        id: String,
        #[source]
        source: DriverError,
    },

    #[error("Tag id '{0}' is reserved for internally generated tags")]
    ReservedTagId(String),

    #[error("Duplicate tag id '{0}'")]
    DuplicateTag(String),

    #[error("Tag '{tag}' references unknown function '{name}'")]
    UnknownFunction { tag: String, name: String },

    #[error("Tag '{tag}' has invalid value info: {reason}")]
    InvalidValueInfo { tag: String, reason: String },

    #[error("Tag '{tag}' has an invalid calc interval")]
    InvalidInterval { tag: String },
}

/// Recoverable errors for requests naming something that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Unknown call: {0}")]
    UnknownCall(String),
}

/// A value could not be converted between telemetry and engineering form.
///
/// The tag keeps its last good value when this happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("No state is mapped to telemetry value {0}")]
    UnmappedTelemetry(Value),

    #[error("Telemetry value {value} maps to {count} states")]
    AmbiguousTelemetry { value: Value, count: usize },

    #[error("No telemetry value is mapped to state {0}")]
    UnmappedState(Value),

    #[error("State {state} maps to {count} telemetry values")]
    AmbiguousState { state: Value, count: usize },

    #[error("Analog value {0} is not numeric")]
    NotNumeric(Value),

    #[error("Analog transform of {0} produced a non-finite result")]
    NonFinite(f64),
}

/// A periodic calculation failed for one tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("{0}")]
    Failed(String),

    #[error("calculation panicked: {0}")]
    Panicked(String),
}

/// Errors raised while constructing a driver from its configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    #[error("Invalid driver configuration: {0}")]
    InvalidConfig(String),

    #[error("Driver unavailable: {0}")]
    Unavailable(String),
}

/// Umbrella error for request-scoped bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Tag '{tag}': {source}")]
    Coercion {
        tag: String,
        #[source]
        source: CoercionError,
    },

    #[error("Tag '{tag}' calc failed: {source}")]
    Calc {
        tag: String,
        #[source]
        source: CalcError,
    },

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tag bus is not running")]
    Closed,
}

impl BusError {
    /// True for errors that mean the request named something missing.
    pub fn is_lookup(&self) -> bool {
        matches!(self, BusError::Lookup(_))
    }
}
