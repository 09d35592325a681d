//! Request metrics middleware.
//!
//! Wraps each request in a `request` span, counts requests by status, and
//! records the duration histogram through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::envelope::Reply;
use crate::service::operation::{ApiRequest, Failure, RequestContext};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn record(ctx: &RequestContext, status: u16) {
    let method = ctx.method.as_str();
    let elapsed_ms = ctx.elapsed_ms();
    metrics::counter!(
        "apiflow_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("apiflow_request_duration_ms", "method" => method.to_string())
        .record(elapsed_ms);

    tracing::Span::current().record("status", status);
    let call_id = ctx.call_id;
    let uri = ctx.uri.as_str();
    match status {
        500.. => tracing::error!(call_id, method, uri, status, elapsed_ms, "request failed"),
        400..=499 => tracing::warn!(call_id, method, uri, status, elapsed_ms, "request rejected"),
        _ => tracing::info!(call_id, method, uri, status, elapsed_ms, "request complete"),
    }
}

impl<S> Service<ApiRequest> for MetricsService<S>
where
    S: Service<ApiRequest, Response = Reply, Error = Failure> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = Failure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, Failure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let ctx = req.ctx.clone();
        let span = info_span!(
            "request",
            call_id = ctx.call_id,
            method = %ctx.method,
            endpoint = %ctx.endpoint,
            version = ctx.version,
            status = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                let status = match &result {
                    Ok(reply) => reply.status,
                    Err(failure) => failure.status(),
                };
                record(&ctx, status);
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
