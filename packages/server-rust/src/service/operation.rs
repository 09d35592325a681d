//! Request types flowing through the pipeline, the failure classification, and
//! the `Endpoint` seam business logic plugs into.

use std::time::{Duration, Instant};

use apiflow_core::{ApiError, Identity, Object, RequestInput};
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use tokio_util::sync::CancellationToken;

use crate::envelope::Payload;

/// Context carried with every request through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Process-unique, monotonically increasing id used in logs.
    pub call_id: u64,
    pub method: Method,
    /// Path and query exactly as received; part of the dedup fingerprint.
    pub uri: String,
    /// API version parsed from the `/v{n}/` prefix.
    pub version: u32,
    /// Routing key: the path after the version prefix, digits stripped, no
    /// leading or trailing `/`.
    pub endpoint: String,
    /// Numeric path segments removed from `endpoint`, in order.
    pub path_args: Vec<i64>,
    /// Identity token from the `X-Token` header.
    pub token: Option<String>,
    /// Bypass cache lookup and reservation for this request.
    pub no_cache: bool,
    /// Decoded `User-Agent` (clients may send it base64-encoded).
    pub user_agent: Option<String>,
    pub received_at: Instant,
    /// Budget enforced by the timeout middleware.
    pub timeout: Duration,
    /// Cancelled when the client goes away or the request times out.
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// Context with defaults for everything but the routing fields.
    #[must_use]
    pub fn new(call_id: u64, method: Method, version: u32, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            call_id,
            method,
            uri: format!("/v{version}/{endpoint}"),
            version,
            endpoint,
            path_args: Vec::new(),
            token: None,
            no_cache: false,
            user_agent: None,
            received_at: Instant::now(),
            timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    /// Milliseconds since the request was received.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_ms(&self) -> f64 {
        self.received_at.elapsed().as_secs_f64() * 1000.0
    }
}

/// A classified request: context plus its undecoded input.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub ctx: RequestContext,
    /// Query-string arguments, string-valued.
    pub query: Object,
    /// Raw body bytes, decoded only when the endpoint runs.
    pub body: Bytes,
}

impl ApiRequest {
    #[must_use]
    pub fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            query: Object::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Object) -> Self {
        self.query = query;
        self
    }
}

/// Outcome of a failed request, classified by who can fix it.
///
/// `Client` errors become error envelopes. `Infrastructure` errors (lost
/// database connection, broken cache protocol) take the fatal path and
/// terminate the process so a supervisor can restart it.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error(transparent)]
    Client(#[from] ApiError),
    #[error("infrastructure failure: {0:#}")]
    Infrastructure(#[from] anyhow::Error),
}

impl Failure {
    /// Wraps any infrastructure error.
    pub fn infrastructure(err: impl Into<anyhow::Error>) -> Self {
        Self::Infrastructure(err.into())
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }

    /// Status reported for this failure when it reaches the transport.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Client(err) => err.status(),
            Self::Infrastructure(_) => 500,
        }
    }
}

/// Everything an endpoint receives for one call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: RequestContext,
    pub input: RequestInput,
    /// Resolved caller; `None` for anonymous access.
    pub identity: Option<Identity>,
}

impl Invocation {
    /// The caller, or `AccessDenied` when the request is anonymous.
    ///
    /// # Errors
    ///
    /// `AccessDenied` for anonymous requests.
    pub fn me(&self) -> Result<&Identity, ApiError> {
        self.identity
            .as_ref()
            .ok_or_else(|| ApiError::AccessDenied("#auth #token Token invalid".to_string()))
    }

    /// Numeric path segment at `pos`, e.g. the `7` in `/v1/widgets/7`.
    ///
    /// # Errors
    ///
    /// `MissingArgument` when the path has fewer numeric segments.
    pub fn path_arg(&self, pos: usize) -> Result<i64, ApiError> {
        self.ctx
            .path_args
            .get(pos)
            .copied()
            .ok_or_else(|| ApiError::MissingArgument {
                name: format!("path[{pos}]"),
                detail: String::new(),
            })
    }
}

/// Business logic behind one `(endpoint, version, method)` route.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Runs the endpoint.
    ///
    /// Validation and business errors are returned as `Failure::Client`;
    /// storage or transport breakage as `Failure::Infrastructure`.
    async fn call(&self, inv: Invocation) -> Result<Payload, Failure>;
}

/// Adapter turning an async closure into an [`Endpoint`].
pub struct EndpointFn<F>(pub F);

#[async_trait]
impl<F, Fut> Endpoint for EndpointFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, Failure>> + Send + 'static,
{
    async fn call(&self, inv: Invocation) -> Result<Payload, Failure> {
        (self.0)(inv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_status() {
        assert_eq!(Failure::from(ApiError::NotFound("x".into())).status(), 404);
        let infra = Failure::infrastructure(std::io::Error::other("db gone"));
        assert!(infra.is_fatal());
        assert_eq!(infra.status(), 500);
    }

    #[test]
    fn question_mark_classifies_client_errors() {
        fn parse() -> Result<(), Failure> {
            Err(ApiError::missing_field("name"))?;
            Ok(())
        }
        assert!(matches!(parse(), Err(Failure::Client(ApiError::MissingField { .. }))));
    }

    #[test]
    fn anonymous_invocation_has_no_identity() {
        let inv = Invocation {
            ctx: RequestContext::new(1, Method::GET, 1, "me"),
            input: RequestInput::default(),
            identity: None,
        };
        assert_eq!(inv.me().unwrap_err().status(), 401);
        assert!(inv.path_arg(0).is_err());
    }
}
