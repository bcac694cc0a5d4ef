//! Tag store.
//!
//! The store owns the canonical current value of every tag together with
//! its coercion metadata, driver binding and optional periodic calculation.
//! All mutation goes through [`TagStore::set_value`], which debounces equal
//! values and produces at most one [`TagChanged`] per call.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::coerce::{values_equal, ValueInfo};
use crate::config::{FunctionTable, TagDef};
use crate::error::{BusError, CalcError, LoadError, LookupError};
use crate::model::{DriverBinding, TagChanged, TagSnapshot};
use crate::pattern::TagMatcher;

/// Prefix reserved for internally generated tags.
pub const SYSTEM_TAG_PREFIX: &str = "sys.";

/// Read-only view handed to periodic calculations.
pub struct CalcContext<'a> {
    tag: &'a Tag,
    store: &'a TagStore,
}

impl<'a> CalcContext<'a> {
    /// The tag being calculated.
    pub fn tag(&self) -> &Tag {
        self.tag
    }

    /// Current value of any tag in the store.
    pub fn value_of(&self, id: &str) -> Option<&Value> {
        self.store.value(id)
    }

    /// Current value of a tag as a number, if it is one.
    pub fn number_of(&self, id: &str) -> Option<f64> {
        self.value_of(id).and_then(Value::as_f64)
    }
}

/// A typed calculation closure registered by the host.
pub type CalcFn = Arc<dyn Fn(&CalcContext<'_>) -> Result<Value, CalcError> + Send + Sync>;

/// A calculation run on a fixed interval, its result fed through `set_value`.
#[derive(Clone)]
pub struct PeriodicCalc {
    pub interval: Duration,
    pub function: String,
    func: CalcFn,
}

impl PeriodicCalc {
    pub fn new(interval: Duration, function: impl Into<String>, func: CalcFn) -> Self {
        Self {
            interval,
            function: function.into(),
            func,
        }
    }
}

impl fmt::Debug for PeriodicCalc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicCalc")
            .field("interval", &self.interval)
            .field("function", &self.function)
            .finish()
    }
}

/// A named process point.
#[derive(Debug, Clone)]
pub struct Tag {
    id: String,
    value: Value,
    value_info: ValueInfo,
    binding: Option<DriverBinding>,
    calc: Option<PeriodicCalc>,
}

impl Tag {
    pub fn new(id: impl Into<String>, default_value: Value) -> Self {
        Self {
            id: id.into(),
            value: default_value,
            value_info: ValueInfo::Untyped,
            binding: None,
            calc: None,
        }
    }

    pub fn with_value_info(mut self, value_info: ValueInfo) -> Self {
        self.value_info = value_info;
        self
    }

    pub fn with_binding(mut self, binding: DriverBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_calc(mut self, calc: PeriodicCalc) -> Self {
        self.calc = Some(calc);
        self
    }

    /// Build a tag from its configuration, resolving named functions.
    pub fn from_def(id: &str, def: &TagDef, functions: &FunctionTable) -> Result<Self, LoadError> {
        let mut tag = Tag::new(id, def.default_value.clone());
        if let Some(info) = &def.value_info {
            tag.value_info = info.build(id, functions)?;
        }
        tag.binding = def.driverinfo.clone();
        if let Some(calc) = &def.calc {
            if calc.interval_ms == 0 {
                return Err(LoadError::InvalidInterval { tag: id.to_string() });
            }
            let func = functions
                .calc(&calc.function)
                .ok_or_else(|| LoadError::UnknownFunction {
                    tag: id.to_string(),
                    name: calc.function.clone(),
                })?;
            tag.calc = Some(PeriodicCalc::new(
                Duration::from_millis(calc.interval_ms),
                calc.function.clone(),
                func,
            ));
        }
        Ok(tag)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_info(&self) -> &ValueInfo {
        &self.value_info
    }

    pub fn binding(&self) -> Option<&DriverBinding> {
        self.binding.as_ref()
    }

    pub fn calc(&self) -> Option<&PeriodicCalc> {
        self.calc.as_ref()
    }
}

/// Owner of every tag in one bus instance.
#[derive(Debug, Default)]
pub struct TagStore {
    tags: HashMap<String, Tag>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load tag definitions from configuration.
    ///
    /// Ids in the reserved `sys.` namespace are logged and skipped. Any other
    /// invalid definition aborts the load.
    pub fn load(
        &mut self,
        defs: &BTreeMap<String, TagDef>,
        functions: &FunctionTable,
    ) -> Result<(), LoadError> {
        for (id, def) in defs {
            if id.starts_with(SYSTEM_TAG_PREFIX) {
                error!("{}", LoadError::ReservedTagId(id.clone()));
                continue;
            }
            let tag = Tag::from_def(id, def, functions)?;
            self.insert(tag)?;
        }
        debug!("Loaded {} tags", self.tags.len());
        Ok(())
    }

    /// Add a tag. Ids are never reused.
    pub fn insert(&mut self, tag: Tag) -> Result<(), LoadError> {
        if self.tags.contains_key(tag.id()) {
            return Err(LoadError::DuplicateTag(tag.id.clone()));
        }
        self.tags.insert(tag.id.clone(), tag);
        Ok(())
    }

    /// Create an internally generated `sys.*` tag bound to a driver item.
    pub fn create_system_tag(
        &mut self,
        id: &str,
        default_value: Value,
        binding: DriverBinding,
    ) -> Result<(), LoadError> {
        if !id.starts_with(SYSTEM_TAG_PREFIX) {
            return Err(LoadError::InvalidValueInfo {
                tag: id.to_string(),
                reason: format!("system tags must start with '{SYSTEM_TAG_PREFIX}'"),
            });
        }
        self.insert(Tag::new(id, default_value).with_binding(binding))
    }

    pub fn get(&self, id: &str) -> Option<&Tag> {
        self.tags.get(id)
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.tags.get(id).map(Tag::value)
    }

    pub fn snapshot(&self, id: &str) -> Option<TagSnapshot> {
        self.tags.get(id).map(|t| TagSnapshot {
            id: t.id.clone(),
            value: t.value.clone(),
            value_info: t.value_info.describe(),
            driverinfo: t.binding.clone(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tags.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// All tag ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tags.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of tags selected by `matcher`, sorted.
    pub fn ids_matching(&self, matcher: &TagMatcher) -> Vec<String> {
        if let TagMatcher::Exact(id) = matcher {
            return if self.contains(id) {
                vec![id.clone()]
            } else {
                Vec::new()
            };
        }
        let mut ids: Vec<String> = self
            .tags
            .keys()
            .filter(|id| matcher.matches(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Tags bound to a driver item, with their bindings.
    pub fn bindings(&self) -> Vec<(String, DriverBinding)> {
        let mut bound: Vec<(String, DriverBinding)> = self
            .tags
            .values()
            .filter_map(|t| t.binding.clone().map(|b| (t.id.clone(), b)))
            .collect();
        bound.sort_by(|a, b| a.0.cmp(&b.0));
        bound
    }

    /// Tags with periodic calculations and their intervals.
    pub fn calc_schedule(&self) -> Vec<(String, Duration)> {
        let mut schedule: Vec<(String, Duration)> = self
            .tags
            .values()
            .filter_map(|t| t.calc.as_ref().map(|c| (t.id.clone(), c.interval)))
            .collect();
        schedule.sort();
        schedule
    }

    /// Apply a raw telemetry value to a tag.
    ///
    /// The value is coerced to its engineering form first. Returns the change
    /// event when the value actually changed and `None` when it was equal to
    /// the current value. On a coercion error the tag keeps its previous value.
    pub fn set_value(&mut self, id: &str, raw: Value) -> Result<Option<TagChanged>, BusError> {
        let tag = self
            .tags
            .get_mut(id)
            .ok_or_else(|| LookupError::UnknownTag(id.to_string()))?;

        let value = tag.value_info.to_engineering(&raw).map_err(|source| {
            let err = BusError::Coercion {
                tag: id.to_string(),
                source,
            };
            error!("{}", err);
            err
        })?;

        if values_equal(&tag.value, &value) {
            return Ok(None);
        }

        tag.value = value;
        Ok(Some(TagChanged::new(id, tag.value.clone())))
    }

    /// Convert an engineering value to the telemetry a driver expects.
    pub fn coerce_value(&self, id: &str, value: &Value) -> Result<Value, BusError> {
        let tag = self
            .tags
            .get(id)
            .ok_or_else(|| LookupError::UnknownTag(id.to_string()))?;

        tag.value_info.to_telemetry(value).map_err(|source| {
            let err = BusError::Coercion {
                tag: id.to_string(),
                source,
            };
            error!("{}", err);
            err
        })
    }

    /// Evaluate a tag's periodic calculation and apply the result.
    ///
    /// Failures, including panics inside the closure, are logged and returned;
    /// the tag keeps its previous value.
    pub fn run_calc(&mut self, id: &str) -> Result<Option<TagChanged>, BusError> {
        let tag = self
            .tags
            .get(id)
            .ok_or_else(|| LookupError::UnknownTag(id.to_string()))?;
        let Some(calc) = tag.calc.clone() else {
            return Ok(None);
        };

        let ctx = CalcContext { tag, store: self };
        let outcome = catch_unwind(AssertUnwindSafe(|| (calc.func)(&ctx)))
            .unwrap_or_else(|panic| Err(CalcError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(value) => self.set_value(id, value),
            Err(source) => {
                let err = BusError::Calc {
                    tag: id.to_string(),
                    source,
                };
                error!("{}", err);
                Err(err)
            }
        }
    }
}

/// Best effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
