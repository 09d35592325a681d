//! Field declarations: the constraints applied to one named input value.

use std::fmt;
use std::sync::Arc;

use crate::collection::Collection;
use crate::error::ApiError;
use crate::object::{schema_name, validated_fields, Object, Schema};
use crate::types::Value;

/// Why a coercion rejected its input.
#[derive(Debug)]
pub enum CoerceError {
    /// The value cannot be converted to the target type.
    Mismatch,
    /// A nested schema rejected the value; propagated unchanged.
    Invalid(ApiError),
}

type CoerceFn = Arc<dyn Fn(Value) -> Result<Value, CoerceError> + Send + Sync>;
type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Conversion applied to a non-null raw value before it is checked and stored.
#[derive(Clone)]
pub struct Coerce {
    target: String,
    apply: CoerceFn,
}

impl Coerce {
    fn new(
        target: impl Into<String>,
        apply: impl Fn(Value) -> Result<Value, CoerceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            apply: Arc::new(apply),
        }
    }

    /// Integer coercion: integers, integral-or-truncated floats, booleans, and numeric strings.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn int() -> Self {
        Self::new("int", |value| match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| CoerceError::Mismatch),
            _ => Err(CoerceError::Mismatch),
        })
    }

    /// Float coercion: numbers, booleans, and numeric strings.
    #[must_use]
    pub fn float() -> Self {
        Self::new("float", |value| match value {
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| CoerceError::Mismatch),
            other => other.as_f64().map(Value::Float).ok_or(CoerceError::Mismatch),
        })
    }

    /// Boolean coercion: booleans, `0`/`1`, and the usual textual spellings.
    #[must_use]
    pub fn bool() -> Self {
        Self::new("bool", |value| match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Int(0) => Ok(Value::Bool(false)),
            Value::Int(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(CoerceError::Mismatch),
            },
            _ => Err(CoerceError::Mismatch),
        })
    }

    /// String coercion: scalars are rendered as text; containers are rejected.
    #[must_use]
    pub fn string() -> Self {
        Self::new("str", |value| match value {
            Value::String(s) => Ok(Value::String(s)),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => Ok(Value::String(value.to_string())),
            _ => Err(CoerceError::Mismatch),
        })
    }

    /// Custom coercion. Returning `None` rejects the value as the wrong type.
    pub fn with(
        target: impl Into<String>,
        f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::new(target, move |value| f(&value).ok_or(CoerceError::Mismatch))
    }

    /// Validates a nested mapping against schema `S`.
    ///
    /// Errors raised by `S`'s own declarations propagate unchanged.
    #[must_use]
    pub fn schema<S: Schema>() -> Self {
        Self::new(schema_name::<S>(), |value| match value {
            Value::Object(raw) => nested_object::<S>(&raw).map(Value::Object),
            _ => Err(CoerceError::Mismatch),
        })
    }

    /// Validates every mapping item of a nested list against schema `S`.
    ///
    /// Lists whose items are not all mappings pass through unmodified.
    #[must_use]
    pub fn collection<S: Schema>() -> Self {
        let target = format!("list[{}]", schema_name::<S>());
        Self::new(target, |value| match value {
            Value::List(list) if list.is_typed() => {
                let items = list
                    .iter()
                    .map(nested_object::<S>)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(Collection::from_items(items)))
            }
            Value::List(list) => Ok(Value::List(list)),
            _ => Err(CoerceError::Mismatch),
        })
    }

    /// Name of the target type, quoted in `WrongType` errors.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn apply(&self, value: Value) -> Result<Value, CoerceError> {
        (self.apply)(value)
    }
}

fn nested_object<S: Schema>(raw: &Object) -> Result<Object, CoerceError> {
    let validated = validated_fields::<S>(raw).map_err(CoerceError::Invalid)?;
    // Fails early when the validated mapping cannot populate the typed record.
    S::from_object(validated.clone()).map_err(CoerceError::Invalid)?;
    Ok(validated)
}

impl fmt::Debug for Coerce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Coerce").field(&self.target).finish()
    }
}

/// Constraint a coerced, non-null value must satisfy.
#[derive(Clone)]
pub enum Check {
    /// The value must equal one of the listed values.
    OneOf(Vec<Value>),
    /// The predicate must return `true`.
    Predicate(PredicateFn),
}

impl Check {
    pub fn one_of<I, V>(allowed: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::OneOf(allowed.into_iter().map(Into::into).collect())
    }

    pub fn predicate(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Returns `None` when the value passes, or the reason it failed.
    fn verify(&self, value: &Value) -> Option<String> {
        match self {
            Self::OneOf(allowed) if !allowed.contains(value) => {
                let listed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                Some(format!("not in [{}]", listed.join(", ")))
            }
            Self::Predicate(f) if !f(value) => Some(String::new()),
            _ => None,
        }
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneOf(allowed) => f.debug_tuple("OneOf").field(allowed).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Declaration of a single field: name plus validation constraints.
///
/// Built fluently and handed to
/// [`Declarations::declare`](crate::object::Declarations::declare):
///
/// ```
/// use apiflow_core::{Check, Coerce, Field};
///
/// let field = Field::new("kind")
///     .coerce(Coerce::string())
///     .check(Check::one_of(["a", "b"]))
///     .default("a")
///     .error("kind must be a or b");
/// assert_eq!(field.name(), "kind");
/// ```
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    default: Option<Value>,
    coerce: Option<Coerce>,
    check: Option<Check>,
    error: String,
    required: bool,
    allow_none: bool,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            coerce: None,
            check: None,
            error: String::new(),
            required: false,
            allow_none: false,
        }
    }

    /// Value used when the field is absent or null.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn coerce(mut self, coerce: Coerce) -> Self {
        self.coerce = Some(coerce);
        self
    }

    #[must_use]
    pub fn check(mut self, check: Check) -> Self {
        self.check = Some(check);
        self
    }

    /// Extra text appended to any error raised for this field.
    #[must_use]
    pub fn error(mut self, text: impl Into<String>) -> Self {
        self.error = text.into();
        self
    }

    /// Absent, null, or empty-string input fails with `MissingField`.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Keep the field as an explicit null instead of omitting it.
    #[must_use]
    pub const fn allow_none(mut self) -> Self {
        self.allow_none = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn allows_none(&self) -> bool {
        self.allow_none
    }

    /// Resolves this field against a raw mapping.
    ///
    /// # Errors
    ///
    /// `MissingField` for absent required input, `WrongType` when coercion
    /// fails, `WrongFormat` when the check fails, or whatever error a nested
    /// schema raised.
    pub fn resolve(&self, raw: &Object) -> Result<TypedValue, ApiError> {
        let present = raw.contains_key(&self.name);
        let value = self.resolve_value(raw.get(&self.name), |field| ApiError::MissingField {
            field: field.name.clone(),
            detail: field.error.clone(),
        })?;
        Ok(TypedValue {
            name: self.name.clone(),
            present,
            value,
        })
    }

    /// Runs the required/default/coerce/check pipeline on one raw value.
    ///
    /// `missing` builds the error raised when a required value is absent, so
    /// callers can distinguish body fields from query arguments.
    ///
    /// # Errors
    ///
    /// See [`Field::resolve`].
    pub fn resolve_value(
        &self,
        raw: Option<&Value>,
        missing: impl FnOnce(&Self) -> ApiError,
    ) -> Result<Value, ApiError> {
        if self.required && raw.is_none_or(Value::is_missing) {
            return Err(missing(self));
        }

        let mut value = match raw {
            Some(v) if !v.is_null() => v.clone(),
            _ => self.default.clone().unwrap_or(Value::Null),
        };

        if value.is_null() {
            return Ok(value);
        }

        if let Some(coerce) = &self.coerce {
            value = coerce.apply(value).map_err(|err| match err {
                CoerceError::Mismatch => ApiError::WrongType {
                    field: self.name.clone(),
                    expected: coerce.target().to_string(),
                    detail: self.error.clone(),
                },
                CoerceError::Invalid(inner) => inner,
            })?;
        }

        if let Some(check) = &self.check {
            if let Some(reason) = check.verify(&value) {
                return Err(ApiError::WrongFormat {
                    field: self.name.clone(),
                    reason,
                    detail: self.error.clone(),
                });
            }
        }

        Ok(value)
    }
}

/// A resolved field: its name, whether the raw input carried it, and the coerced value.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub name: String,
    pub present: bool,
    pub value: Value,
}

impl TypedValue {
    /// Whether the value belongs in the validated mapping under the given nullability.
    #[must_use]
    pub const fn is_retained(&self, allow_none: bool) -> bool {
        !self.value.is_null() || allow_none
    }
}
