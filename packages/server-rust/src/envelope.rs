//! Uniform response payloads.
//!
//! Business logic returns a [`Payload`] (validated data plus metadata); the
//! pipeline composes it, or an error code, into a [`Reply`] whose body has a
//! fixed shape:
//!
//! ```json
//! {"message": ..., "error": {"code": "#tag", "message": "..."}, "data": ..., "meta": {"shown": n}, "status": 200, "time": 1.25}
//! ```

use std::io::Write;

use apiflow_core::{Collection, ErrorCode, Object, Schema, Value};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

use crate::service::operation::Failure;

/// Status of a successful reply unless the payload overrides it.
pub const DEFAULT_SUCCESS_STATUS: u16 = 200;

/// Code of replies produced by the fatal path.
pub const INTERNAL_ERROR_CODE: &str = "#internal_error";

/// Response metadata: the record count plus caller-supplied extras.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub shown: usize,
    pub extra: Object,
}

impl Meta {
    fn to_json(&self) -> serde_json::Value {
        let mut meta = Map::new();
        meta.insert("shown".to_string(), json!(self.shown));
        meta.extend(self.extra.to_json());
        serde_json::Value::Object(meta)
    }
}

/// Successful result of an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub data: Value,
    pub meta: Meta,
    pub message: Option<String>,
    pub status: Option<u16>,
}

impl Payload {
    /// Wraps data, counting records: list length, 1 for any other value, 0 for null.
    #[must_use]
    pub fn new(data: impl Into<Value>) -> Self {
        let data = data.into();
        let shown = match &data {
            Value::Null => 0,
            Value::List(list) => list.len(),
            _ => 1,
        };
        Self {
            data,
            meta: Meta {
                shown,
                extra: Object::new(),
            },
            message: None,
            status: None,
        }
    }

    /// Wraps a typed record.
    #[must_use]
    pub fn of<S: Schema>(record: &S) -> Self {
        Self::new(record.to_value())
    }

    /// Wraps a typed collection.
    #[must_use]
    pub fn collection<T: Schema>(items: &Collection<T>) -> Self {
        let data: Vec<Object> = items
            .iter()
            .filter_map(|item| match item.to_value() {
                Value::Object(o) => Some(o),
                _ => None,
            })
            .collect();
        Self::new(Collection::from_items(data))
    }

    /// A reply carrying only a message.
    #[must_use]
    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(Value::Null)
        }
    }

    /// Adds a metadata field next to `shown`.
    #[must_use]
    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.extra.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Either a payload or an error; never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    Payload(Payload),
    Error(ErrorCode),
}

impl From<Payload> for ResultEnvelope {
    fn from(payload: Payload) -> Self {
        Self::Payload(payload)
    }
}

impl From<ErrorCode> for ResultEnvelope {
    fn from(code: ErrorCode) -> Self {
        Self::Error(code)
    }
}

/// A composed response: status plus JSON body, before timing and compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    pub body: Map<String, serde_json::Value>,
}

/// Bytes ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub status: u16,
    pub body: Vec<u8>,
    pub gzip: bool,
}

impl Reply {
    /// Composes a reply.
    ///
    /// An error (explicit, or carried by `result`) takes precedence: its code
    /// is split into tags and message and the status is derived from the
    /// tags unless `status` is given. Otherwise the payload's data and
    /// metadata are emitted with status 200 unless overridden.
    #[must_use]
    pub fn compose(
        message: Option<&str>,
        result: Option<ResultEnvelope>,
        error: Option<ErrorCode>,
        status: Option<u16>,
    ) -> Self {
        let error = error.or(match &result {
            Some(ResultEnvelope::Error(code)) => Some(code.clone()),
            _ => None,
        });

        let mut body = Map::new();
        let status = if let Some(code) = error {
            body.insert("message".into(), serde_json::Value::Null);
            body.insert(
                "error".into(),
                json!({"code": code.code(), "message": code.message()}),
            );
            body.insert("data".into(), serde_json::Value::Null);
            body.insert("meta".into(), serde_json::Value::Null);
            status.unwrap_or_else(|| code.status())
        } else if let Some(ResultEnvelope::Payload(payload)) = result {
            let message = message.map(str::to_string).or(payload.message);
            body.insert("message".into(), json!(message));
            body.insert("error".into(), serde_json::Value::Null);
            body.insert("data".into(), serde_json::Value::from(&payload.data));
            body.insert("meta".into(), payload.meta.to_json());
            status.or(payload.status).unwrap_or(DEFAULT_SUCCESS_STATUS)
        } else {
            body.insert("message".into(), json!(message));
            body.insert("error".into(), serde_json::Value::Null);
            body.insert("data".into(), serde_json::Value::Null);
            body.insert("meta".into(), serde_json::Value::Null);
            status.unwrap_or(DEFAULT_SUCCESS_STATUS)
        };
        body.insert("status".into(), json!(status));
        Self { status, body }
    }

    #[must_use]
    pub fn payload(payload: Payload) -> Self {
        Self::compose(None, Some(payload.into()), None, None)
    }

    #[must_use]
    pub fn error(code: impl Into<ErrorCode>) -> Self {
        Self::compose(None, None, Some(code.into()), None)
    }

    /// Reply for an infrastructure failure. Details are exposed only in debug mode.
    #[must_use]
    pub fn internal(detail: Option<&str>) -> Self {
        let raw = match detail {
            Some(detail) => format!("{INTERNAL_ERROR_CODE} {detail}"),
            None => INTERNAL_ERROR_CODE.to_string(),
        };
        Self::compose(None, None, Some(ErrorCode::parse(&raw)), Some(500))
    }

    /// Reply for a failure that escaped the pipeline.
    #[must_use]
    pub fn from_failure(failure: &Failure, debug: bool) -> Self {
        match failure {
            Failure::Client(err) => Self::error(err),
            Failure::Infrastructure(err) => {
                let detail = debug.then(|| format!("{err:#}"));
                Self::internal(detail.as_deref())
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error code of an error reply.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.get("code")?.as_str()
    }

    /// Serializes the body with the elapsed time, gzip-compressing when `compression_level > 0`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if serialization or compression fails.
    pub fn render(&self, elapsed_ms: f64, compression_level: u32) -> std::io::Result<Rendered> {
        let mut body = self.body.clone();
        body.insert("time".into(), json!((elapsed_ms * 1000.0).round() / 1000.0));
        let bytes = serde_json::to_vec(&body)?;
        if compression_level == 0 {
            return Ok(Rendered {
                status: self.status,
                body: bytes,
                gzip: false,
            });
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(compression_level.min(9)));
        encoder.write_all(&bytes)?;
        Ok(Rendered {
            status: self.status,
            body: encoder.finish()?,
            gzip: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use apiflow_core::ApiError;
    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn error_status_from_tags() {
        let reply = Reply::error("#not_found widget missing");
        assert_eq!(reply.status, 404);
        assert_eq!(reply.error_code(), Some("#not_found"));
        assert_eq!(reply.body["error"]["message"], "widget missing");
        assert_eq!(reply.body["status"], 404);
        assert!(reply.body["data"].is_null());
    }

    #[test]
    fn untagged_error_is_whole_message() {
        let reply = Reply::error("no tag here");
        assert_eq!(reply.status, 400);
        assert_eq!(reply.body["error"], json!({"code": "#error", "message": "no tag here"}));
    }

    #[test]
    fn explicit_status_wins() {
        let reply = Reply::compose(None, None, Some("#not_found x".into()), Some(410));
        assert_eq!(reply.status, 410);
    }

    #[test]
    fn error_in_result_takes_precedence() {
        let code = ErrorCode::from(ApiError::AccessDenied("#auth no".into()));
        let reply = Reply::compose(Some("hi"), Some(code.into()), None, None);
        assert_eq!(reply.status, 401);
        assert!(reply.body["message"].is_null());
    }

    #[test]
    fn payload_counts_records_and_merges_meta() {
        let list = Collection::passthrough(vec![json!({"id": 1}), json!({"id": 2})]);
        let reply = Reply::payload(Payload::new(list).with_meta("total", 10));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["meta"], json!({"shown": 2, "total": 10}));
        assert_eq!(reply.body["data"], json!([{"id": 1}, {"id": 2}]));
        assert!(reply.body["error"].is_null());
    }

    #[test]
    fn message_only_reply() {
        let reply = Reply::payload(Payload::message_only("done"));
        assert_eq!(reply.body["message"], "done");
        assert_eq!(reply.body["meta"], json!({"shown": 0}));
    }

    #[test]
    fn internal_hides_details_unless_debug() {
        let failure = Failure::infrastructure(anyhow::anyhow!("pool closed"));
        let quiet = Reply::from_failure(&failure, false);
        assert_eq!(quiet.status, 500);
        assert_eq!(quiet.body["error"]["message"], "");
        let loud = Reply::from_failure(&failure, true);
        assert!(loud.body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("pool closed")));
    }

    #[test]
    fn render_adds_time_and_compresses() {
        let reply = Reply::payload(Payload::message_only("ok"));
        let plain = reply.render(1.23456, 0).unwrap();
        assert!(!plain.gzip);
        let parsed: serde_json::Value = serde_json::from_slice(&plain.body).unwrap();
        assert_eq!(parsed["time"], json!(1.235));

        let packed = reply.render(1.0, 6).unwrap();
        assert!(packed.gzip);
        let mut text = String::new();
        GzDecoder::new(packed.body.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        let unpacked: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(unpacked["message"], "ok");
    }
}
