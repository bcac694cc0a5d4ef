//! Project configuration.
//!
//! The project file is read once at startup and describes:
//! - Server settings (listen address, name)
//! - Drivers to instantiate, by id, with their implementation location
//! - Tags, with default value, driver binding, value info and periodic calc
//!
//! Per-tag behaviour is never compiled from text. Calculations and analog
//! transforms are referenced by name and resolved against a [`FunctionTable`]
//! of closures the host registers before loading.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::coerce::{AnalogTransform, DiscreteState, ValueInfo};
use crate::error::{CalcError, LoadError};
use crate::model::DriverBinding;
use crate::store::{CalcContext, CalcFn};

/// Default listen port when neither the project nor the environment set one.
pub const DEFAULT_PORT: u16 = 8000;

/// Top level project file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub drivers: BTreeMap<String, DriverDef>,

    #[serde(default)]
    pub tags: BTreeMap<String, TagDef>,
}

impl ProjectConfig {
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

/// Server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Address to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_ip: Option<IpAddr>,

    /// Port to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Server name sent in the hello message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ServerSettings {
    /// Listen address, falling back to the given overrides and then defaults.
    pub fn listen_addr(&self, env_ip: Option<IpAddr>, env_port: Option<u16>) -> SocketAddr {
        let ip = self
            .listen_ip
            .or(env_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let port = self.listen_port.or(env_port).unwrap_or(DEFAULT_PORT);
        SocketAddr::new(ip, port)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("tagbus")
    }
}

/// A driver to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverDef {
    /// Implementation location, resolved against the driver catalog.
    pub uri: String,

    /// Driver specific configuration.
    #[serde(default)]
    pub config: Value,
}

/// A tag definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDef {
    #[serde(default)]
    pub default_value: Value,

    /// Driver item this tag follows. Unbound tags live in memory.
    #[serde(default, alias = "driverInfo", skip_serializing_if = "Option::is_none")]
    pub driverinfo: Option<DriverBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_info: Option<ValueInfoDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc: Option<CalcDef>,
}

/// Periodic calculation reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcDef {
    pub interval_ms: u64,
    /// Name of a closure registered in the [`FunctionTable`].
    pub function: String,
}

/// One row of a discrete state table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteStateDef {
    pub value: Value,
    pub state: Value,
}

/// Value info as written in the project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValueInfoDef {
    Untyped,
    Discrete {
        states: Vec<DiscreteStateDef>,
    },
    #[serde(rename_all = "camelCase")]
    Analog {
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        /// Named transform; overrides scale/offset when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Object {
        #[serde(default)]
        parse_strings: bool,
    },
}

fn default_scale() -> f64 {
    1.0
}

impl ValueInfoDef {
    /// Resolve into the runtime [`ValueInfo`].
    pub fn build(&self, tag: &str, functions: &FunctionTable) -> Result<ValueInfo, LoadError> {
        let invalid = |reason: &str| LoadError::InvalidValueInfo {
            tag: tag.to_string(),
            reason: reason.to_string(),
        };

        match self {
            ValueInfoDef::Untyped => Ok(ValueInfo::Untyped),
            ValueInfoDef::Discrete { states } => {
                if states.is_empty() {
                    return Err(invalid("discrete value info needs at least one state"));
                }
                Ok(ValueInfo::Discrete(
                    states
                        .iter()
                        .map(|s| DiscreteState::new(s.value.clone(), s.state.clone()))
                        .collect(),
                ))
            }
            ValueInfoDef::Analog {
                scale,
                offset,
                transform,
                min,
                max,
            } => {
                let base = match transform {
                    Some(name) => {
                        functions
                            .transform(name)
                            .ok_or_else(|| LoadError::UnknownFunction {
                                tag: tag.to_string(),
                                name: name.clone(),
                            })?
                    }
                    None => {
                        if *scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
                            return Err(invalid("analog scale must be finite and non-zero"));
                        }
                        AnalogTransform::linear(*scale, *offset)
                    }
                };
                Ok(ValueInfo::Analog(base.with_range(*min, *max)))
            }
            ValueInfoDef::Object { parse_strings } => Ok(ValueInfo::Object {
                parse_strings: *parse_strings,
            }),
        }
    }
}

/// Named closures referenced from the project file.
#[derive(Default, Clone)]
pub struct FunctionTable {
    calcs: HashMap<String, CalcFn>,
    transforms: HashMap<String, AnalogTransform>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic calculation under `name`.
    pub fn register_calc<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(&CalcContext<'_>) -> Result<Value, CalcError> + Send + Sync + 'static,
    {
        self.calcs.insert(name.into(), Arc::new(func));
        self
    }

    /// Register an analog transform under `name`.
    pub fn register_transform(
        &mut self,
        name: impl Into<String>,
        transform: AnalogTransform,
    ) -> &mut Self {
        self.transforms.insert(name.into(), transform);
        self
    }

    pub fn calc(&self, name: &str) -> Option<CalcFn> {
        self.calcs.get(name).cloned()
    }

    pub fn transform(&self, name: &str) -> Option<AnalogTransform> {
        self.transforms.get(name).cloned()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut calcs: Vec<&String> = self.calcs.keys().collect();
        calcs.sort();
        let mut transforms: Vec<&String> = self.transforms.keys().collect();
        transforms.sort();
        f.debug_struct("FunctionTable")
            .field("calcs", &calcs)
            .field("transforms", &transforms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const PROJECT: &str = r#"{
        "server": {"listenIp": "0.0.0.0", "listenPort": 9000, "name": "plant"},
        "drivers": {"plc1": {"uri": "loopback", "config": {"rate": 5}}},
        "tags": {
            "press1": {"defaultValue": 0, "driverinfo": {"id": "sim", "item": "randomInt:1000:0:0:100"}},
            "pump1.status": {
                "defaultValue": "NORMAL",
                "valueInfo": {"type": "discrete", "states": [
                    {"value": 0, "state": "NORMAL"},
                    {"value": 1, "state": "ALARM"}
                ]}
            },
            "tank.level": {
                "defaultValue": 0,
                "valueInfo": {"type": "analog", "scale": 0.1, "min": 0, "max": 100}
            },
            "recipe": {"valueInfo": {"type": "object", "parseStrings": true}}
        }
    }"#;

    #[test]
    fn test_parse_project() {
        let config = ProjectConfig::from_json_str(PROJECT).unwrap();

        assert_eq!(config.server.name(), "plant");
        assert_eq!(
            config.server.listen_addr(None, None),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.drivers["plc1"].uri, "loopback");
        assert_eq!(config.drivers["plc1"].config["rate"], 5);
        assert_eq!(
            config.tags["press1"].driverinfo,
            Some(DriverBinding::new("sim", "randomInt:1000:0:0:100"))
        );
        assert_eq!(config.tags["recipe"].default_value, Value::Null);
    }

    #[test]
    fn test_server_defaults_and_overrides() {
        let settings = ServerSettings::default();
        assert_eq!(settings.name(), "tagbus");
        assert_eq!(
            settings.listen_addr(None, None),
            "127.0.0.1:8000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            settings.listen_addr(Some("10.0.0.1".parse().unwrap()), Some(81)),
            "10.0.0.1:81".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_missing_driver_uri_is_load_error() {
        let err = ProjectConfig::from_json_str(r#"{"drivers": {"plc1": {"config": {}}}}"#)
            .unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn test_unknown_section_is_load_error() {
        assert!(ProjectConfig::from_json_str(r#"{"tagz": {}}"#).is_err());
    }

    #[test]
    fn test_build_value_info() {
        let config = ProjectConfig::from_json_str(PROJECT).unwrap();
        let functions = FunctionTable::new();

        let discrete = config.tags["pump1.status"]
            .value_info
            .as_ref()
            .unwrap()
            .build("pump1.status", &functions)
            .unwrap();
        assert_eq!(discrete.to_telemetry(&json!("ALARM")).unwrap(), json!(1));

        let analog = config.tags["tank.level"]
            .value_info
            .as_ref()
            .unwrap()
            .build("tank.level", &functions)
            .unwrap();
        assert_eq!(analog.to_engineering(&json!(500)).unwrap(), json!(50));
        assert_eq!(
            analog.describe(),
            json!({"type": "analog", "transform": "linear(0.1, 0)", "min": 0.0, "max": 100.0})
        );
    }

    #[test]
    fn test_invalid_value_info() {
        let functions = FunctionTable::new();
        let empty = ValueInfoDef::Discrete { states: vec![] };
        assert!(matches!(
            empty.build("t", &functions),
            Err(LoadError::InvalidValueInfo { .. })
        ));

        let flat = ValueInfoDef::Analog {
            scale: 0.0,
            offset: 0.0,
            transform: None,
            min: None,
            max: None,
        };
        assert!(flat.build("t", &functions).is_err());

        let named = ValueInfoDef::Analog {
            scale: 1.0,
            offset: 0.0,
            transform: Some("celsius".into()),
            min: None,
            max: None,
        };
        assert!(matches!(
            named.build("t", &functions),
            Err(LoadError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_named_transform() {
        let mut functions = FunctionTable::new();
        functions.register_transform(
            "fahrenheit",
            AnalogTransform::new("fahrenheit", |c| c * 9.0 / 5.0 + 32.0, |f| (f - 32.0) * 5.0 / 9.0),
        );
        let def = ValueInfoDef::Analog {
            scale: 1.0,
            offset: 0.0,
            transform: Some("fahrenheit".into()),
            min: Some(-40.0),
            max: None,
        };
        let info = def.build("oven.temp", &functions).unwrap();
        assert_eq!(info.to_engineering(&json!(100)).unwrap(), json!(212));
        assert_eq!(info.to_telemetry(&json!(32)).unwrap(), json!(0));
    }
}
