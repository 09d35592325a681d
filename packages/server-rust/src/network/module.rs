//! Network module with deferred startup.
//!
//! `new()` assembles shared state, `start()` binds the listener, and
//! `serve()` accepts connections until shutdown. Between `start()` and
//! `serve()` the caller can hand the shutdown token to background workers.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::util::BoxCloneSyncService;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{api_handler, health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::{build_pipeline, Executor, RequestClassifier, ServerConfig};

/// Owns the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Wraps `executor` in the request pipeline without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, server: Arc<ServerConfig>, executor: Executor) -> Self {
        let state = AppState {
            pipeline: BoxCloneSyncService::new(build_pipeline(executor, &server)),
            classifier: Arc::new(RequestClassifier::new(Arc::clone(&server))),
            shutdown: Arc::new(ShutdownController::new()),
            config: server,
            start_time: Instant::now(),
        };
        Self {
            config,
            listener: None,
            state,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - everything else -- the versioned API
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback(api_handler)
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port (OS-assigned when 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let controller = Arc::clone(&self.state.shutdown);

        controller.set_ready();
        info!("serving HTTP");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }
}
