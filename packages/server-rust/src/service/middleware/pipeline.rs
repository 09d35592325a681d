//! Pipeline composition: wraps the executor with the middleware layers.

use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::envelope::Reply;
use crate::service::config::ServerConfig;
use crate::service::executor::Executor;
use crate::service::operation::{ApiRequest, Failure};

/// Builds the request pipeline around `executor`.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, counters, and duration for every request, shed ones included
/// 2. `LoadShedLayer` -- reject when overloaded before doing any work
/// 3. `TimeoutLayer` -- enforce the per-request budget and cancel on expiry
///
/// The returned service is `Clone + Sync`, so it can be boxed into handler state.
#[must_use]
pub fn build_pipeline(
    executor: Executor,
    config: &ServerConfig,
) -> impl tower::Service<
    ApiRequest,
    Response = Reply,
    Error = Failure,
    Future = impl std::future::Future<Output = Result<Reply, Failure>> + Send,
> + Clone
       + Send
       + Sync
       + 'static {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(LoadShedLayer::new(config.max_concurrent_requests))
        .layer(TimeoutLayer)
        .service(executor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
