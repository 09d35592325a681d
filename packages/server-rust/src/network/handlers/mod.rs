//! HTTP handlers and the shared state they extract.

pub mod api;
pub mod health;

pub use api::api_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use tower::util::BoxCloneSyncService;

use super::ShutdownController;
use crate::envelope::Reply;
use crate::service::{ApiRequest, Failure, RequestClassifier, ServerConfig};

/// The middleware-wrapped executor as stored in handler state.
pub type Pipeline = BoxCloneSyncService<ApiRequest, Reply, Failure>;

/// Shared state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub classifier: Arc<RequestClassifier>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<ServerConfig>,
    /// Process start time, for uptime.
    pub start_time: Instant,
}
