use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::collection::Collection;
use crate::object::Object;

/// Validated runtime value held by an [`Object`].
///
/// Supports all JSON-compatible types. Nested mappings are always wrapped as
/// [`Object`] and nested sequences as [`Collection`], so a value tree built
/// from raw input never contains untyped JSON containers.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// JSON null.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// JSON array, wrapped as a collection of objects when every item is a mapping.
    List(Collection),
    /// JSON object.
    Object(Object),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` for values a required field treats as absent: null or an empty string.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Truthiness used when collapsing boolean flags.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(c) => !c.is_empty(),
            Self::Object(o) => !o.is_empty(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_list(&self) -> Option<&Collection> {
        match self {
            Self::List(c) => Some(c),
            _ => None,
        }
    }

    /// Short name of the variant, used in coercion error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "str",
            Self::List(_) => "list",
            Self::Object(_) => "object",
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(Collection::passthrough(items)),
            serde_json::Value::Object(map) => Self::Object(Object::passthrough(map)),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s.clone()),
            Value::List(c) => Self::Array(c.to_json()),
            Value::Object(o) => Self::Object(o.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
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

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Self::Object(o)
    }
}

impl From<Collection> for Value {
    fn from(c: Collection) -> Self {
        Self::List(c)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", serde_json::Value::from(other)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) => serializer.serialize_str(s),
            Self::List(c) => c.serialize(serializer),
            Self::Object(o) => o.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

/// Hashable identity extracted from a [`Value`], used by collection indexes and joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Key {
    /// Extracts a key from scalar values. Floats qualify only when integral.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Self::Int(*i)),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(Self::Int(*f as i64)),
            _ => None,
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(i) => Self::Int(i),
            Key::Str(s) => Self::String(s),
            Key::Bool(b) => Self::Bool(b),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Authenticated caller resolved from a request token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identifier of the caller.
    pub id: String,
    /// Role checked against an endpoint's allowed roles.
    pub role: String,
    /// Free-form profile fields carried along for business logic.
    #[serde(default)]
    pub profile: Object,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn nested_json_is_wrapped_recursively() {
        let value = Value::from(json!({
            "user": {"name": "ann"},
            "tags": [{"id": 1}, {"id": 2}],
            "scores": [1, 2, 3],
        }));
        let object = value.as_object().unwrap();
        assert!(matches!(object.get("user"), Some(Value::Object(_))));

        let tags = object.get("tags").and_then(Value::as_list).unwrap();
        assert!(tags.is_typed());
        assert_eq!(tags.len(), 2);

        let scores = object.get("scores").and_then(Value::as_list).unwrap();
        assert!(!scores.is_typed());
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn numbers_keep_integer_precision() {
        assert_eq!(Value::from(json!(7)), Value::Int(7));
        assert_eq!(Value::from(json!(7.5)), Value::Float(7.5));
    }

    #[test]
    fn converts_back_to_json() {
        let raw = json!({"a": [1, {"b": null}], "c": "d"});
        let value = Value::from(raw.clone());
        assert_eq!(serde_json::Value::from(&value), raw);
    }

    #[test]
    fn missing_means_null_or_empty_string() {
        assert!(Value::Null.is_missing());
        assert!(Value::from("").is_missing());
        assert!(!Value::from(0).is_missing());
        assert!(!Value::from(false).is_missing());
    }

    #[test]
    fn key_from_integral_float() {
        assert_eq!(Key::from_value(&Value::Float(3.0)), Some(Key::Int(3)));
        assert_eq!(Key::from_value(&Value::Float(3.5)), None);
        assert_eq!(Key::from_value(&Value::Null), None);
    }
}
