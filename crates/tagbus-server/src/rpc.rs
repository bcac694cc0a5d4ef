//! Named calls reachable through `app_call`.
//!
//! The table starts with the core calls and can be extended by the host
//! before the bus is loaded. Calls run on the bus task with exclusive access
//! to the bus state, so they must not block.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use tagbus_core::{BusError, LookupError, TagMatcher};

use crate::bus::{BusCommand, BusState};

/// A call implementation. Receives the request `data` and returns the result.
pub type RpcFn = Arc<dyn Fn(&mut BusState, Value) -> Result<Value, BusError> + Send + Sync>;

#[derive(Clone)]
pub struct RpcTable {
    calls: BTreeMap<String, RpcFn>,
}

impl RpcTable {
    /// A table with no calls at all.
    pub fn empty() -> Self {
        Self {
            calls: BTreeMap::new(),
        }
    }

    /// A table with the core calls registered.
    pub fn new() -> Self {
        let mut table = Self::empty();
        table
            .register("write_tag_request", write_tag_request)
            .register("pulse_tag_request", pulse_tag_request)
            .register("query_tags", query_tags)
            .register("read_tag", read_tag)
            .register("query_driver_info", query_driver_info)
            .register("query_tag_value_info", query_tag_value_info)
            .register("start_driver", start_driver)
            .register("stop_driver", stop_driver);
        table
    }

    /// Add or replace a call.
    pub fn register<F>(&mut self, name: impl Into<String>, call: F) -> &mut Self
    where
        F: Fn(&mut BusState, Value) -> Result<Value, BusError> + Send + Sync + 'static,
    {
        self.calls.insert(name.into(), Arc::new(call));
        self
    }

    pub fn get(&self, name: &str) -> Option<RpcFn> {
        self.calls.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.calls.keys().map(String::as_str).collect()
    }
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTable")
            .field("calls", &self.names())
            .finish()
    }
}

/// Decode call data. A missing payload is treated as an empty object.
fn parse<T: DeserializeOwned>(call: &str, data: Value) -> Result<T, BusError> {
    let data = if data.is_null() { json!({}) } else { data };
    serde_json::from_value(data).map_err(|e| BusError::InvalidRequest(format!("{call}: {e}")))
}

#[derive(Debug, Deserialize)]
struct WriteTagRequest {
    tagid: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct PulseTagRequest {
    tagid: String,
    value: Value,
    /// Milliseconds before the previous value is written back.
    duration: u64,
}

#[derive(Debug, Default, Deserialize)]
struct QueryTagsRequest {
    #[serde(default)]
    pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    tagid: String,
}

#[derive(Debug, Default, Deserialize)]
struct DriverRequest {
    #[serde(default)]
    id: Option<String>,
}

fn write_tag_request(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: WriteTagRequest = parse("write_tag_request", data)?;
    state.write_tag(&req.tagid, req.value).map(Value::Bool)
}

fn pulse_tag_request(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: PulseTagRequest = parse("pulse_tag_request", data)?;
    let previous = state
        .store()
        .value(&req.tagid)
        .cloned()
        .ok_or_else(|| LookupError::UnknownTag(req.tagid.clone()))?;

    let accepted = state.write_tag(&req.tagid, req.value)?;
    debug!(
        "Pulse on {} reverts to {} in {}ms",
        req.tagid, previous, req.duration
    );
    state.schedule(
        Duration::from_millis(req.duration),
        BusCommand::WriteTag {
            tag: req.tagid,
            value: previous,
        },
    );
    Ok(Value::Bool(accepted))
}

fn query_tags(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: QueryTagsRequest = parse("query_tags", data)?;
    let ids = match req.pattern {
        Some(pattern) => state.store().ids_matching(&TagMatcher::parse(&pattern)?),
        None => state.store().ids(),
    };
    Ok(json!(ids))
}

fn read_tag(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: TagRequest = parse("read_tag", data)?;
    let snapshot = state
        .store()
        .snapshot(&req.tagid)
        .ok_or(LookupError::UnknownTag(req.tagid))?;
    serde_json::to_value(snapshot).map_err(|e| BusError::InvalidRequest(e.to_string()))
}

fn query_driver_info(state: &mut BusState, _data: Value) -> Result<Value, BusError> {
    serde_json::to_value(state.registry().info())
        .map_err(|e| BusError::InvalidRequest(e.to_string()))
}

fn query_tag_value_info(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: TagRequest = parse("query_tag_value_info", data)?;
    let tag = state
        .store()
        .get(&req.tagid)
        .ok_or(LookupError::UnknownTag(req.tagid.clone()))?;
    Ok(tag.value_info().describe())
}

fn start_driver(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: DriverRequest = parse("start_driver", data)?;
    state.start_driver(req.id.as_deref())?;
    Ok(Value::Bool(true))
}

fn stop_driver(state: &mut BusState, data: Value) -> Result<Value, BusError> {
    let req: DriverRequest = parse("stop_driver", data)?;
    state.stop_driver(req.id.as_deref())?;
    Ok(Value::Bool(true))
}
