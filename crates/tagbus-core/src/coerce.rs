//! Telemetry <-> engineering value coercion.
//!
//! Every tag carries a [`ValueInfo`] describing how raw driver values
//! (telemetry) map onto the values clients see (engineering values):
//!
//! | Variant | Forward (telemetry → engineering) | Reverse |
//! |---|---|---|
//! | `Untyped` | numeric parse of strings, else identity | same |
//! | `Discrete` | table lookup value → state | table lookup state → value |
//! | `Analog` | caller supplied transform | caller supplied inverse |
//! | `Object` | identity, optional JSON parse of strings | identity |

use serde_json::{Number, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::CoercionError;

/// One row of a discrete state table.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteState {
    /// Raw value as produced by the driver
    pub value: Value,
    /// Engineering state shown to clients (e.g., "ALARM")
    pub state: Value,
}

impl DiscreteState {
    pub fn new(value: impl Into<Value>, state: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            state: state.into(),
        }
    }
}

type ScalarFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Monotonic transform between raw counts and engineering units.
///
/// `min`/`max` are informational. Values outside the range are not clamped.
#[derive(Clone)]
pub struct AnalogTransform {
    forward: ScalarFn,
    reverse: ScalarFn,
    label: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AnalogTransform {
    /// Build a transform from a forward function and its inverse.
    pub fn new<F, R>(label: impl Into<String>, forward: F, reverse: R) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
        R: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
            reverse: Arc::new(reverse),
            label: label.into(),
            min: None,
            max: None,
        }
    }

    /// `engineering = raw * scale + offset`. `scale` must be non-zero.
    pub fn linear(scale: f64, offset: f64) -> Self {
        Self::new(
            format!("linear({scale}, {offset})"),
            move |raw| raw * scale + offset,
            move |eng| (eng - offset) / scale,
        )
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn apply(&self, f: &ScalarFn, input: &Value) -> Result<Value, CoercionError> {
        let x = as_f64(input).ok_or_else(|| CoercionError::NotNumeric(input.clone()))?;
        let y = f(x);
        number_value(y).ok_or(CoercionError::NonFinite(x))
    }
}

impl fmt::Debug for AnalogTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogTransform")
            .field("label", &self.label)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

/// How a tag's raw telemetry maps to its engineering value.
#[derive(Debug, Clone, Default)]
pub enum ValueInfo {
    #[default]
    Untyped,
    Discrete(Vec<DiscreteState>),
    Analog(AnalogTransform),
    Object {
        parse_strings: bool,
    },
}

impl ValueInfo {
    /// Convert a raw driver value to the engineering value stored on the tag.
    pub fn to_engineering(&self, raw: &Value) -> Result<Value, CoercionError> {
        match self {
            ValueInfo::Untyped => Ok(parse_numeric(raw).unwrap_or_else(|| raw.clone())),
            ValueInfo::Discrete(states) => {
                let found = lookup(states, raw, |s| &s.value);
                match found.as_slice() {
                    [one] => Ok(one.state.clone()),
                    [] => Err(CoercionError::UnmappedTelemetry(raw.clone())),
                    many => Err(CoercionError::AmbiguousTelemetry {
                        value: raw.clone(),
                        count: many.len(),
                    }),
                }
            }
            ValueInfo::Analog(transform) => transform.apply(&transform.forward, raw),
            ValueInfo::Object { parse_strings } => match raw {
                Value::String(s) if *parse_strings => {
                    Ok(serde_json::from_str(s).unwrap_or_else(|_| raw.clone()))
                }
                _ => Ok(raw.clone()),
            },
        }
    }

    /// Convert an engineering value back to the raw value a driver expects.
    pub fn to_telemetry(&self, engineering: &Value) -> Result<Value, CoercionError> {
        match self {
            ValueInfo::Untyped => {
                Ok(parse_numeric(engineering).unwrap_or_else(|| engineering.clone()))
            }
            ValueInfo::Discrete(states) => {
                let found = lookup(states, engineering, |s| &s.state);
                match found.as_slice() {
                    [one] => Ok(one.value.clone()),
                    [] => Err(CoercionError::UnmappedState(engineering.clone())),
                    many => Err(CoercionError::AmbiguousState {
                        state: engineering.clone(),
                        count: many.len(),
                    }),
                }
            }
            ValueInfo::Analog(transform) => transform.apply(&transform.reverse, engineering),
            ValueInfo::Object { .. } => Ok(engineering.clone()),
        }
    }

    /// Describe this value info for `query_tag_value_info`.
    pub fn describe(&self) -> Value {
        match self {
            ValueInfo::Untyped => serde_json::json!({ "type": "untyped" }),
            ValueInfo::Discrete(states) => serde_json::json!({
                "type": "discrete",
                "states": states
                    .iter()
                    .map(|s| serde_json::json!({ "value": s.value, "state": s.state }))
                    .collect::<Vec<_>>(),
            }),
            ValueInfo::Analog(t) => serde_json::json!({
                "type": "analog",
                "transform": t.label,
                "min": t.min,
                "max": t.max,
            }),
            ValueInfo::Object { parse_strings } => serde_json::json!({
                "type": "object",
                "parseStrings": parse_strings,
            }),
        }
    }
}

/// Rows whose `key` equals `probe`, also trying the numeric parse of a string probe.
fn lookup<'a>(
    states: &'a [DiscreteState],
    probe: &Value,
    key: impl Fn(&DiscreteState) -> &Value,
) -> Vec<&'a DiscreteState> {
    let parsed = parse_numeric(probe);
    states
        .iter()
        .filter(|s| {
            values_equal(key(s), probe) || parsed.as_ref().is_some_and(|p| values_equal(key(s), p))
        })
        .collect()
}

/// Value equality used for debouncing.
///
/// Numbers compare by numeric value, so `1` and `1.0` are equal. Two
/// integers compare exactly, even beyond the precision of `f64`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if x.is_f64() || y.is_f64() {
        return match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        };
    }
    match (x.as_i64(), y.as_i64()) {
        (Some(x), Some(y)) => x == y,
        // At least one side is a u64 above i64::MAX.
        _ => x.as_u64().is_some() && x.as_u64() == y.as_u64(),
    }
}

/// Parse a numeric string into a JSON number. Integers stay integers.
///
/// Returns `None` for non-strings and strings that are not numbers.
pub fn parse_numeric(value: &Value) -> Option<Value> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>().ok().and_then(number_value)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(_) => parse_numeric(value).and_then(|v| v.as_f64()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn number_value(x: f64) -> Option<Value> {
    if !x.is_finite() {
        return None;
    }
    if x.fract() == 0.0 && x.abs() < 9.0e15 {
        return Some(Value::Number((x as i64).into()));
    }
    Number::from_f64(x).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn alarm_states() -> ValueInfo {
        ValueInfo::Discrete(vec![
            DiscreteState::new(0, "NORMAL"),
            DiscreteState::new(1, "ALARM"),
        ])
    }

    #[test]
    fn test_untyped_parses_numeric_strings() {
        let info = ValueInfo::Untyped;
        assert_eq!(info.to_engineering(&json!("42")).unwrap(), json!(42));
        assert_eq!(info.to_engineering(&json!("3.5")).unwrap(), json!(3.5));
        assert_eq!(info.to_engineering(&json!("open")).unwrap(), json!("open"));
        assert_eq!(info.to_engineering(&json!(true)).unwrap(), json!(true));
    }

    #[test]
    fn test_discrete_round_trip() {
        let info = alarm_states();
        assert_eq!(info.to_telemetry(&json!("ALARM")).unwrap(), json!(1));
        assert_eq!(info.to_engineering(&json!(1)).unwrap(), json!("ALARM"));
        assert_eq!(info.to_engineering(&json!(0)).unwrap(), json!("NORMAL"));
    }

    #[test]
    fn test_discrete_accepts_float_and_string_telemetry() {
        let info = alarm_states();
        assert_eq!(info.to_engineering(&json!(1.0)).unwrap(), json!("ALARM"));
        assert_eq!(info.to_engineering(&json!("1")).unwrap(), json!("ALARM"));
    }

    #[test]
    fn test_discrete_unmapped_is_error() {
        let info = alarm_states();
        assert_eq!(
            info.to_engineering(&json!(7)),
            Err(CoercionError::UnmappedTelemetry(json!(7)))
        );
        assert_eq!(
            info.to_telemetry(&json!("TRIPPED")),
            Err(CoercionError::UnmappedState(json!("TRIPPED")))
        );
    }

    #[test]
    fn test_discrete_ambiguous_is_error() {
        let info = ValueInfo::Discrete(vec![
            DiscreteState::new(0, "OFF"),
            DiscreteState::new(0, "STOPPED"),
            DiscreteState::new(1, "OFF"),
        ]);
        assert_eq!(
            info.to_engineering(&json!(0)),
            Err(CoercionError::AmbiguousTelemetry {
                value: json!(0),
                count: 2
            })
        );
        assert_eq!(
            info.to_telemetry(&json!("OFF")),
            Err(CoercionError::AmbiguousState {
                state: json!("OFF"),
                count: 2
            })
        );
    }

    #[test]
    fn test_analog_linear_does_not_clamp() {
        let info = ValueInfo::Analog(AnalogTransform::linear(0.1, 0.0).with_range(Some(0.0), Some(100.0)));
        assert_eq!(info.to_engineering(&json!(500)).unwrap(), json!(50));
        assert_eq!(info.to_engineering(&json!(2000)).unwrap(), json!(200));
        assert_eq!(info.to_telemetry(&json!(25)).unwrap(), json!(250));
    }

    #[test]
    fn test_analog_custom_transform() {
        let info = ValueInfo::Analog(AnalogTransform::new("square", |x| x * x, f64::sqrt));
        assert_eq!(info.to_engineering(&json!(3)).unwrap(), json!(9));
        assert_eq!(info.to_telemetry(&json!(16)).unwrap(), json!(4));
    }

    #[test]
    fn test_analog_rejects_non_numeric() {
        let info = ValueInfo::Analog(AnalogTransform::linear(2.0, 0.0));
        assert_eq!(
            info.to_engineering(&json!("high")),
            Err(CoercionError::NotNumeric(json!("high")))
        );
        let div = ValueInfo::Analog(AnalogTransform::new("inv", |x| 1.0 / x, |x| 1.0 / x));
        assert_eq!(div.to_engineering(&json!(0)), Err(CoercionError::NonFinite(0.0)));
    }

    #[test]
    fn test_object_parses_json_strings() {
        let info = ValueInfo::Object { parse_strings: true };
        assert_eq!(
            info.to_engineering(&json!(r#"{"a":1}"#)).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(info.to_engineering(&json!("{broken")).unwrap(), json!("{broken"));

        let opaque = ValueInfo::Object { parse_strings: false };
        assert_eq!(opaque.to_engineering(&json!("[1,2]")).unwrap(), json!("[1,2]"));
    }

    #[test]
    fn test_values_equal_numeric() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!([1, {"x": 2}]), &json!([1.0, {"x": 2.0}])));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(!values_equal(&json!({"x": 1}), &json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_values_equal_large_integers() {
        assert!(!values_equal(
            &json!(9007199254740992_i64),
            &json!(9007199254740993_i64)
        ));
        assert!(!values_equal(&json!(u64::MAX), &json!(u64::MAX - 1)));
        assert!(!values_equal(&json!(-1), &json!(u64::MAX)));
        assert!(values_equal(&json!(u64::MAX), &json!(u64::MAX)));
        assert!(values_equal(&json!(i64::MIN), &json!(i64::MIN)));
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            alarm_states().describe(),
            json!({
                "type": "discrete",
                "states": [
                    {"value": 0, "state": "NORMAL"},
                    {"value": 1, "state": "ALARM"}
                ]
            })
        );
        assert_eq!(ValueInfo::Untyped.describe(), json!({"type": "untyped"}));
    }
}
