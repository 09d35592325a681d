use crate::error::ApiError;
use crate::field::Field;
use crate::object::{validate_object, Object, Schema};
use crate::types::Value;

/// Decoded input of one API call: query arguments plus the JSON body.
///
/// Handlers read from it through field declarations, so absent required
/// values surface as `MissingArgument` (query) or `MissingField` (body).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInput {
    /// Query-string arguments, all string-valued.
    pub query: Object,
    /// Request body: an object, a list, or an empty object when no body was sent.
    pub body: Value,
}

impl RequestInput {
    /// Builds the input from query arguments and raw body bytes.
    ///
    /// # Errors
    ///
    /// `MalformedBody` when the body is not valid JSON or is a bare scalar.
    pub fn parse(query: Object, body: &[u8]) -> Result<Self, ApiError> {
        Ok(Self {
            query,
            body: parse_body(body)?,
        })
    }

    /// Resolves a query argument.
    ///
    /// # Errors
    ///
    /// `MissingArgument` for an absent required argument, otherwise any
    /// coercion or check error.
    pub fn arg(&self, field: &Field) -> Result<Value, ApiError> {
        field.resolve_value(self.query.get(field.name()), |f| ApiError::MissingArgument {
            name: f.name().to_string(),
            detail: String::new(),
        })
    }

    /// Resolves a top-level body field. A list body has no fields.
    ///
    /// # Errors
    ///
    /// `MissingField` for an absent required field, otherwise any coercion or
    /// check error.
    pub fn body_field(&self, field: &Field) -> Result<Value, ApiError> {
        let raw = self.body.as_object().and_then(|body| body.get(field.name()));
        field.resolve_value(raw, |f| ApiError::missing_field(f.name()))
    }

    /// Validates the whole body into schema `S`.
    ///
    /// # Errors
    ///
    /// `WrongType` when the body is not an object, otherwise the first
    /// validation error.
    pub fn body_as<S: Schema>(&self) -> Result<S, ApiError> {
        match &self.body {
            Value::Object(raw) => validate_object(raw),
            other => Err(ApiError::WrongType {
                field: "body".to_string(),
                expected: "object".to_string(),
                detail: format!("got {}", other.type_name()),
            }),
        }
    }
}

/// Parses a request body. Empty or whitespace-only input is an empty object.
///
/// # Errors
///
/// `MalformedBody` for invalid JSON or a top-level scalar.
pub fn parse_body(bytes: &[u8]) -> Result<Value, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Object::new()));
    }
    let raw: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| ApiError::MalformedBody(err.to_string()))?;
    match raw {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => Ok(Value::from(raw)),
        _ => Err(ApiError::MalformedBody(
            "body must be a JSON object or array".to_string(),
        )),
    }
}
