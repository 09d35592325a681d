//! Load-shedding middleware.
//!
//! Rejects requests with `ApiError::Overloaded` once the number of in-flight
//! requests reaches `max_concurrent_requests`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use apiflow_core::ApiError;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::envelope::Reply;
use crate::service::operation::{ApiRequest, Failure};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent requests via a semaphore.
///
/// When all permits are taken, requests are rejected immediately rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<ApiRequest> for LoadShedService<S>
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
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            metrics::counter!("apiflow_requests_shed_total").increment(1);
            return Box::pin(async { Err(ApiError::Overloaded.into()) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
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

    fn request() -> ApiRequest {
        ApiRequest::new(RequestContext::new(1, Method::GET, 1, "slow"))
    }

    #[tokio::test]
    async fn allows_requests_under_limit() {
        let svc = LoadShedLayer::new(10).layer(SlowService {
            delay: Duration::from_millis(1),
        });
        assert!(svc.oneshot(request()).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let mut svc = LoadShedLayer::new(1).layer(SlowService {
            delay: Duration::from_millis(500),
        });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let in_flight = svc.call(request());
        let _held = tokio::spawn(in_flight);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.call(request()).await.unwrap_err();
        assert!(matches!(err, Failure::Client(ApiError::Overloaded)));
        assert_eq!(err.status(), 503);
    }

    #[tokio::test]
    async fn permit_released_after_completion() {
        let mut svc = LoadShedLayer::new(1).layer(SlowService {
            delay: Duration::from_millis(1),
        });
        for _ in 0..3 {
            let _ = ServiceExt::ready(&mut svc).await.unwrap();
            assert!(svc.call(request()).await.is_ok());
        }
    }
}
