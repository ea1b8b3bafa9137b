//! Engine-side value model.
//!
//! Wire payloads are plain JSON; decoded values may additionally carry live
//! host references, bound commands and the non-JSON sentinels.

use std::fmt;

use indexmap::IndexMap;

use crate::callback::CommandRef;
use crate::error::BridgeError;
use crate::host::{HostRef, same_object};

/// String-keyed mapping that keeps wire order.
pub type Map = IndexMap<String, Value>;

/// Primitives with no JSON literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Special {
    Undefined,
    NaN,
    Infinity,
    NegInfinity,
}

impl Special {
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::NaN => "NaN",
            Self::Infinity => "Infinity",
            Self::NegInfinity => "-Infinity",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "undefined" => Some(Self::Undefined),
            "NaN" => Some(Self::NaN),
            "Infinity" => Some(Self::Infinity),
            "-Infinity" => Some(Self::NegInfinity),
            _ => None,
        }
    }

    /// Numeric value, `None` for `undefined`.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Undefined => None,
            Self::NaN => Some(f64::NAN),
            Self::Infinity => Some(f64::INFINITY),
            Self::NegInfinity => Some(f64::NEG_INFINITY),
        }
    }
}

impl fmt::Display for Special {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    Special(Special),
    /// Live host object, crosses the wire as a handle.
    Host(HostRef),
    /// Host object read off another object; `receiver` is its `this`.
    Bound { object: HostRef, receiver: HostRef },
    /// Invocable stand-in for a backend command or callback.
    Command(CommandRef),
}

pub const UNDEFINED: Value = Value::Special(Special::Undefined);

impl Value {
    /// Literal conversion; no tag interpretation happens here.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON without escaping. Sentinels become `null`; live
    /// references cannot be represented and are rejected.
    pub fn to_plain_json(&self) -> Result<serde_json::Value, BridgeError> {
        Ok(match self {
            Self::Null | Self::Special(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Self::to_plain_json)
                    .collect::<Result<_, _>>()?,
            ),
            Self::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_plain_json()?);
                }
                serde_json::Value::Object(out)
            }
            Self::Host(_) | Self::Bound { .. } | Self::Command(_) => {
                return Err(BridgeError::protocol(format!(
                    "{} value needs escaping to cross the wire",
                    self.type_name()
                )));
            }
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "mapping",
            Self::Special(Special::Undefined) => "undefined",
            Self::Special(_) => "number",
            Self::Host(_) | Self::Bound { .. } => "host object",
            Self::Command(_) => "command",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Special(Special::Undefined))
    }

    /// `null` or `undefined`.
    pub fn is_nullish(&self) -> bool {
        self.is_null() || self.is_undefined()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::Special(s) => s.as_f64(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// The referenced host object, bound or not.
    pub fn as_host(&self) -> Option<&HostRef> {
        match self {
            Self::Host(obj) | Self::Bound { object: obj, .. } => Some(obj),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&CommandRef> {
        match self {
            Self::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Truthiness as the host environment understands it.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null | Self::Special(Special::Undefined | Special::NaN) => false,
            Self::Bool(b) => *b,
            Self::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Self::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Special(a), Self::Special(b)) => a == b,
            (Self::Host(a), Self::Host(b)) => same_object(a, b),
            (
                Self::Bound {
                    object: a,
                    receiver: ra,
                },
                Self::Bound {
                    object: b,
                    receiver: rb,
                },
            ) => same_object(a, b) && same_object(ra, rb),
            (Self::Command(a), Self::Command(b)) => a == b,
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        if f.is_nan() {
            Self::Special(Special::NaN)
        } else if f == f64::INFINITY {
            Self::Special(Special::Infinity)
        } else if f == f64::NEG_INFINITY {
            Self::Special(Special::NegInfinity)
        } else {
            serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number)
        }
    }
}

impl From<HostRef> for Value {
    fn from(obj: HostRef) -> Self {
        Self::Host(obj)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::host::PropertyObject;

    #[test]
    fn from_json_keeps_structure_and_order() {
        let value = Value::from_json(json!({"z": 1, "a": [true, null, "~@"]}));
        let map = value.as_object().unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), ["z", "a"]);
        assert_eq!(
            map["a"],
            Value::Array(vec![Value::Bool(true), Value::Null, Value::from("~@")])
        );
    }

    #[test]
    fn plain_json_maps_sentinels_to_null() {
        let value = Value::Array(vec![UNDEFINED, Value::from(f64::NAN), Value::from(1.5)]);
        assert_eq!(value.to_plain_json().unwrap(), json!([null, null, 1.5]));
    }

    #[test]
    fn plain_json_rejects_host_objects() {
        let obj: HostRef = Arc::new(PropertyObject::new("div"));
        let err = Value::Array(vec![Value::Host(obj)])
            .to_plain_json()
            .unwrap_err();
        assert_eq!(err.wire_name(), "ProtocolViolationError");
    }

    #[test]
    fn non_finite_floats_become_specials() {
        assert_eq!(Value::from(f64::INFINITY), Value::Special(Special::Infinity));
        assert_eq!(
            Value::from(f64::NEG_INFINITY),
            Value::Special(Special::NegInfinity)
        );
        assert_eq!(Value::from(f64::NAN), Value::Special(Special::NaN));
    }

    #[test]
    fn special_names() {
        for special in [
            Special::Undefined,
            Special::NaN,
            Special::Infinity,
            Special::NegInfinity,
        ] {
            assert_eq!(Special::from_name(special.name()), Some(special));
        }
        assert_eq!(Special::from_name("null"), None);
    }

    #[test]
    fn host_values_compare_by_identity() {
        let a: HostRef = Arc::new(PropertyObject::new("div"));
        let b: HostRef = Arc::new(PropertyObject::new("div"));
        assert_eq!(Value::Host(a.clone()), Value::Host(a.clone()));
        assert_ne!(Value::Host(a), Value::Host(b));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!UNDEFINED.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from(0u32).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
    }
}
