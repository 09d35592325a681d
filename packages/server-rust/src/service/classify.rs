//! Request classification: turns transport-level request parts into an `ApiRequest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use apiflow_core::{ApiError, Object, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, PRAGMA, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use tokio_util::sync::CancellationToken;

use super::config::ServerConfig;
use super::operation::{ApiRequest, RequestContext};

/// Header carrying the caller's identity token.
pub const TOKEN_HEADER: &str = "x-token";

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// A request path split into version, routing key, and numeric arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath {
    pub version: u32,
    pub endpoint: String,
    pub path_args: Vec<i64>,
}

/// Parses `/v{n}/...`.
///
/// Digits are removed from the endpoint so `/v1/users/42/posts` routes as
/// `users/posts`; segments made only of digits become path arguments. Empty
/// segments are dropped.
#[must_use]
pub fn parse_path(path: &str) -> Option<RoutePath> {
    let rest = path.strip_prefix("/v")?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let version = rest[..digits].parse().ok()?;
    let tail = &rest[digits..];
    if !(tail.is_empty() || tail.starts_with('/')) {
        return None;
    }

    let mut segments = Vec::new();
    let mut path_args = Vec::new();
    for segment in tail.split('/') {
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(arg) = segment.parse::<i64>() {
                path_args.push(arg);
            }
            continue;
        }
        let stripped: String = segment.chars().filter(|c| !c.is_ascii_digit()).collect();
        if !stripped.is_empty() {
            segments.push(stripped);
        }
    }

    Some(RoutePath {
        version,
        endpoint: segments.join("/"),
        path_args,
    })
}

// ---------------------------------------------------------------------------
// RequestClassifier
// ---------------------------------------------------------------------------

/// Builds `ApiRequest` values from request parts.
///
/// Each call gets a fresh call id and cancellation token, and the configured
/// request timeout.
pub struct RequestClassifier {
    config: Arc<ServerConfig>,
    call_id_counter: AtomicU64,
}

impl RequestClassifier {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            call_id_counter: AtomicU64::new(1),
        }
    }

    fn next_call_id(&self) -> u64 {
        self.call_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Classifies one request.
    ///
    /// # Errors
    ///
    /// `NotFound` when the path has no `/v{n}/` prefix.
    pub fn classify(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        query: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<ApiRequest, ApiError> {
        let route = parse_path(uri.path())
            .ok_or_else(|| ApiError::NotFound(format!("no such endpoint: {}", uri.path())))?;

        let ctx = RequestContext {
            call_id: self.next_call_id(),
            method,
            uri: uri
                .path_and_query()
                .map_or_else(|| uri.path().to_string(), ToString::to_string),
            version: route.version,
            endpoint: route.endpoint,
            path_args: route.path_args,
            token: header_str(headers, TOKEN_HEADER)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            no_cache: wants_no_cache(headers),
            user_agent: header_str(headers, USER_AGENT.as_str()).map(decode_user_agent),
            received_at: Instant::now(),
            timeout: self.config.request_timeout,
            cancel: CancellationToken::new(),
        };

        let query: Object = query
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();

        Ok(ApiRequest { ctx, query, body })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn wants_no_cache(headers: &HeaderMap) -> bool {
    [CACHE_CONTROL, PRAGMA].iter().any(|name| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache")))
    })
}

/// Clients may send the user agent base64-encoded; plain values pass through.
fn decode_user_agent(raw: &str) -> String {
    STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
