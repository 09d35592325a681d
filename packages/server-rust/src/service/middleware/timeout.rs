//! Timeout middleware.
//!
//! Fails requests that exceed their `ctx.timeout` with `ApiError::Timeout` and
//! cancels the request token so the running endpoint task is aborted.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use apiflow_core::ApiError;
use tower::{Layer, Service};

use crate::envelope::Reply;
use crate::service::operation::{ApiRequest, Failure};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing the per-request budget carried in the request context.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<ApiRequest> for TimeoutService<S>
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
        let budget = req.ctx.timeout;
        let cancel = req.ctx.cancel.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(budget, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    cancel.cancel();
                    #[allow(clippy::cast_possible_truncation)]
                    let after_ms = budget.as_millis() as u64;
                    Err(ApiError::Timeout { after_ms }.into())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;
    use tower::ServiceExt;

    use super::*;
    use crate::envelope::Payload;
    use crate::service::operation::RequestContext;

    struct SlowService {
        delay: Duration,
    }

    impl Service<ApiRequest> for SlowService {
        type Response = Reply;
        type Error = Failure;
        type Future = Pin<Box<dyn Future<Output = Result<Reply, Failure>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ApiRequest) -> Self::Future {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(Reply::payload(Payload::message_only("done")))
            })
        }
    }

    fn request(timeout: Duration) -> ApiRequest {
        let mut ctx = RequestContext::new(1, Method::GET, 1, "slow");
        ctx.timeout = timeout;
        ApiRequest::new(ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn fast_request_passes() {
        let svc = TimeoutLayer.layer(SlowService {
            delay: Duration::from_millis(10),
        });
        let reply = svc.oneshot(request(Duration::from_secs(1))).await.unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out_and_cancels() {
        let svc = TimeoutLayer.layer(SlowService {
            delay: Duration::from_secs(5),
        });
        let req = request(Duration::from_millis(50));
        let token = req.ctx.cancel.clone();

        let err = svc.oneshot(req).await.unwrap_err();
        assert!(matches!(
            err,
            Failure::Client(ApiError::Timeout { after_ms: 50 })
        ));
        assert_eq!(err.status(), 408);
        assert!(token.is_cancelled());
    }
}
