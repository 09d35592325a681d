//! Schema objects: ordered field mappings built from raw input by declared validation steps.
//!
//! Construction has two phases. The raw input mapping is held privately by a
//! [`Declarations`] builder; the schema's [`Schema::declare`] then runs its
//! field declarations in order, each consuming one raw value and writing the
//! validated result. Only declared fields reach the output, except for
//! schemas with no declarations at all, which pass every raw field through.

use std::fmt;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ApiError;
use crate::field::Field;
use crate::types::Value;

/// Dynamic mapping of field name to validated [`Value`], in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    fields: IndexMap<String, Value>,
}

impl Object {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a raw JSON mapping without validation, recursively converting
    /// nested mappings and sequences.
    #[must_use]
    pub fn passthrough(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.get_mut(name)
    }

    /// Inserts or replaces a field, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Removes a field, preserving the order of the rest.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Plain JSON form, recursing into nested objects and collections.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
            .collect()
    }

    /// Drops null-valued fields, except those named in `keep`.
    #[must_use]
    pub fn compact(&self, keep: &[&str]) -> Self {
        self.fields
            .iter()
            .filter(|(k, v)| !v.is_null() || keep.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fields of `self` whose value differs from the same field in `other`.
    ///
    /// A field missing from `other` compares as null.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Self {
        self.fields
            .iter()
            .filter(|(k, v)| other.get(k).unwrap_or(&Value::Null) != *v)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Collapses boolean flags into a single enum field.
    ///
    /// The first variant whose field is truthy is written to `name`. When none
    /// is set, the object is left unchanged.
    pub fn group_enum(&mut self, name: &str, variants: &[&str]) {
        let chosen = variants
            .iter()
            .find(|variant| self.get(variant).is_some_and(Value::is_truthy));
        if let Some(variant) = chosen {
            self.insert(name, *variant);
        }
    }
}

impl FromIterator<(String, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Object {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::Object(self.to_json()))
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Map::deserialize(deserializer).map(Self::passthrough)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A typed record whose fields are validated from raw input by ordered declarations.
///
/// Implementors list their fields in [`declare`](Schema::declare); the
/// validated mapping is then deserialized into `Self`.
///
/// ```
/// use apiflow_core::{validate, ApiError, Coerce, Declarations, Field, Schema};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Serialize, Deserialize)]
/// struct Person {
///     name: String,
///     age: i64,
/// }
///
/// impl Schema for Person {
///     fn declare(d: &mut Declarations<'_>) -> Result<(), ApiError> {
///         d.declare(Field::new("name").coerce(Coerce::string()).required())?;
///         d.declare(Field::new("age").coerce(Coerce::int()).default(0))
///     }
/// }
///
/// let person: Person = validate(json!({"name": "ann", "age": "41"})).unwrap();
/// assert_eq!(person.age, 41);
/// ```
pub trait Schema: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Declares this schema's fields, in order.
    ///
    /// # Errors
    ///
    /// Returns the first validation error raised by a declaration.
    fn declare(decl: &mut Declarations<'_>) -> Result<(), ApiError>;

    /// Builds the typed record from an already validated mapping.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` when the mapping cannot populate the record.
    fn from_object(validated: Object) -> Result<Self, ApiError> {
        serde_json::from_value(serde_json::Value::Object(validated.to_json())).map_err(|err| {
            ApiError::WrongType {
                field: schema_name::<Self>(),
                expected: "object".to_string(),
                detail: err.to_string(),
            }
        })
    }

    /// Dynamic form of this record.
    fn to_value(&self) -> Value {
        serde_json::to_value(self).map_or(Value::Null, Value::from)
    }
}

impl Schema for Object {
    fn declare(_decl: &mut Declarations<'_>) -> Result<(), ApiError> {
        Ok(())
    }

    fn from_object(validated: Object) -> Result<Self, ApiError> {
        Ok(validated)
    }

    fn to_value(&self) -> Value {
        Value::Object(self.clone())
    }
}

/// Short type name of a schema, used as the coercion target in errors.
#[must_use]
pub fn schema_name<S: ?Sized>() -> String {
    let full = std::any::type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Builder that consumes a raw mapping through ordered field declarations.
pub struct Declarations<'a> {
    raw: &'a Object,
    validated: Object,
    declared: usize,
}

impl<'a> Declarations<'a> {
    #[must_use]
    pub fn new(raw: &'a Object) -> Self {
        Self {
            raw,
            validated: Object::new(),
            declared: 0,
        }
    }

    /// Validates one field and writes it to the output mapping.
    ///
    /// Null results are dropped unless the field allows none.
    ///
    /// # Errors
    ///
    /// See [`Field::resolve`].
    pub fn declare(&mut self, field: Field) -> Result<(), ApiError> {
        self.declared += 1;
        let typed = field.resolve(self.raw)?;
        if typed.is_retained(field.allows_none()) {
            self.validated.insert(typed.name, typed.value);
        }
        Ok(())
    }

    /// Read-only view of the raw input, for cross-field checks.
    #[must_use]
    pub const fn raw(&self) -> &Object {
        self.raw
    }

    /// Output mapping built so far.
    #[must_use]
    pub const fn validated(&self) -> &Object {
        &self.validated
    }

    /// Finishes construction. With no declarations, every raw field passes through.
    #[must_use]
    pub fn finish(self) -> Object {
        if self.declared == 0 {
            self.raw.clone()
        } else {
            self.validated
        }
    }
}

/// Runs `S`'s declarations over a raw mapping and returns the validated mapping.
///
/// # Errors
///
/// Returns the first validation error; no partial mapping is exposed.
pub fn validated_fields<S: Schema>(raw: &Object) -> Result<Object, ApiError> {
    let mut decl = Declarations::new(raw);
    S::declare(&mut decl)?;
    Ok(decl.finish())
}

/// Validates a dynamic mapping into schema `S`.
///
/// # Errors
///
/// Returns the first validation error.
pub fn validate_object<S: Schema>(raw: &Object) -> Result<S, ApiError> {
    S::from_object(validated_fields::<S>(raw)?)
}

/// Validates raw JSON into schema `S`. The input must be a JSON object.
///
/// # Errors
///
/// `WrongType` for non-object input, otherwise the first validation error.
pub fn validate<S: Schema>(raw: serde_json::Value) -> Result<S, ApiError> {
    match raw {
        serde_json::Value::Object(map) => validate_object(&Object::passthrough(map)),
        other => Err(ApiError::WrongType {
            field: schema_name::<S>(),
            expected: "object".to_string(),
            detail: format!("got {}", Value::from(other).type_name()),
        }),
    }
}
