//! Property values stored on nodes and relationships
//!
//! A closed set of variants: null, boolean, 64-bit integer, 64-bit float,
//! UTF-8 string, list and string-keyed map. Integers never pass through a
//! float, so values beyond 2^53 round-trip exactly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

/// Property map for nodes and relationships. Ordered so that `keys()` and
/// rendered output are deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A host value with no property representation
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unsupported property value: {0}")]
pub struct UnsupportedValue(pub String);

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value widened to f64 (integers included)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            PropertyValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "Null",
            PropertyValue::Boolean(_) => "Boolean",
            PropertyValue::Integer(_) => "Integer",
            PropertyValue::Float(_) => "Float",
            PropertyValue::String(_) => "String",
            PropertyValue::List(_) => "List",
            PropertyValue::Map(_) => "Map",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            PropertyValue::Null => Json::Null,
            PropertyValue::Boolean(b) => Json::Bool(*b),
            PropertyValue::Integer(i) => Json::from(*i),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            PropertyValue::String(s) => Json::String(s.clone()),
            PropertyValue::List(items) => Json::Array(items.iter().map(|v| v.to_json()).collect()),
            PropertyValue::Map(map) => Json::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert a JSON value. Unsigned integers above `i64::MAX` are rejected
    /// rather than silently turned into floats.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, UnsupportedValue> {
        use serde_json::Value as Json;
        Ok(match value {
            Json::Null => PropertyValue::Null,
            Json::Bool(b) => PropertyValue::Boolean(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyValue::Integer(i)
                } else if n.is_u64() {
                    return Err(UnsupportedValue(format!("integer {} exceeds 64-bit signed range", n)));
                } else if let Some(f) = n.as_f64() {
                    PropertyValue::Float(f)
                } else {
                    return Err(UnsupportedValue(format!("number {}", n)));
                }
            }
            Json::String(s) => PropertyValue::String(s.clone()),
            Json::Array(items) => PropertyValue::List(
                items.iter().map(PropertyValue::from_json).collect::<Result<_, _>>()?,
            ),
            Json::Object(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), PropertyValue::from_json(v)?)))
                    .collect::<Result<_, UnsupportedValue>>()?,
            ),
        })
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(fl) => {
                if fl.is_finite() && fl.fract() == 0.0 {
                    write!(f, "{:.1}", fl)
                } else {
                    write!(f, "{}", fl)
                }
            }
            PropertyValue::String(s) => write!(f, "'{}'", s),
            PropertyValue::List(items) => {
                write!(f, "[")?;
                for (i, val) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            PropertyValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, val)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, val)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Integer(i)
    }
}

impl From<i32> for PropertyValue {
    fn from(i: i32) -> Self {
        PropertyValue::Integer(i as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(items: Vec<PropertyValue>) -> Self {
        PropertyValue::List(items)
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyValue {
    fn from(map: BTreeMap<String, PropertyValue>) -> Self {
        PropertyValue::Map(map)
    }
}
