//! The catch-all API handler: classify, run the pipeline, render the envelope.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tower::ServiceExt;
use tracing::error;

use super::AppState;
use crate::envelope::Reply;

/// Serves every `/v{n}/...` route.
///
/// Client disconnects drop this future; the request's cancellation token is
/// cancelled on drop so the running endpoint task is aborted with it.
pub async fn api_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    let _in_flight = state.shutdown.in_flight_guard();

    let (reply, elapsed_ms) = match state.classifier.classify(method, &uri, &headers, query, body) {
        Ok(req) => {
            let _cancel_on_drop = req.ctx.cancel.clone().drop_guard();
            let ctx = req.ctx.clone();
            let reply = match state.pipeline.clone().oneshot(req).await {
                Ok(reply) => reply,
                Err(failure) => Reply::from_failure(&failure, state.config.debug),
            };
            (reply, ctx.elapsed_ms())
        }
        Err(err) => (Reply::error(&err), 0.0),
    };

    render(&reply, elapsed_ms, state.config.compression_level)
}

fn render(reply: &Reply, elapsed_ms: f64, compression_level: u32) -> Response {
    let rendered = match reply.render(elapsed_ms, compression_level) {
        Ok(rendered) => rendered,
        Err(err) => {
            error!(error = %err, "failed to render reply");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let status = StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(rendered.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if rendered.gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use apiflow_core::Object;
    use axum::body::to_bytes;
    use tower::util::BoxCloneSyncService;

    use super::*;
    use crate::envelope::Payload;
    use crate::network::ShutdownController;
    use crate::service::{
        build_pipeline, EndpointFn, EndpointPolicy, EndpointRouter, Executor, Invocation,
        RequestClassifier, ServerConfig,
    };

    fn state(config: ServerConfig) -> AppState {
        let config = Arc::new(config);
        let mut router = EndpointRouter::new();
        router.register(
            "echo",
            1,
            Method::GET,
            EndpointPolicy::default(),
            EndpointFn(|inv: Invocation| async move {
                let mut data = Object::new();
                data.insert("q", inv.input.query.get("q").cloned());
                Ok(Payload::new(data))
            }),
        );
        let executor = Executor::builder(Arc::clone(&config), router).build();
        AppState {
            pipeline: BoxCloneSyncService::new(build_pipeline(executor, &config)),
            classifier: Arc::new(RequestClassifier::new(Arc::clone(&config))),
            shutdown: Arc::new(ShutdownController::new()),
            config,
            start_time: Instant::now(),
        }
    }

    async fn call(state: AppState, method: Method, uri: &str, query: &[(&str, &str)]) -> Response {
        let query = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        api_handler(
            State(state),
            method,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Query(query),
            Bytes::new(),
        )
        .await
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn renders_success_envelope() {
        let response = call(state(ServerConfig::default()), Method::GET, "/v2/echo?q=hi", &[("q", "hi")]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = json(response).await;
        assert_eq!(body["data"]["q"], "hi");
        assert_eq!(body["status"], 200);
        assert!(body["error"].is_null());
        assert!(body["time"].is_number());
    }

    #[tokio::test]
    async fn unversioned_path_is_404_envelope() {
        let response = call(state(ServerConfig::default()), Method::GET, "/echo", &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["error"]["code"], "#not_found");
    }

    #[tokio::test]
    async fn options_short_circuits() {
        let response = call(state(ServerConfig::default()), Method::OPTIONS, "/v1/echo", &[]).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn gzip_when_compression_enabled() {
        let config = ServerConfig {
            compression_level: 6,
            ..ServerConfig::default()
        };
        let response = call(state(config), Method::GET, "/v1/echo", &[]).await;
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    }

    #[tokio::test]
    async fn in_flight_released_after_response() {
        let state = state(ServerConfig::default());
        let shutdown = Arc::clone(&state.shutdown);
        let _ = call(state, Method::GET, "/v1/echo", &[]).await;
        assert_eq!(shutdown.in_flight_count(), 0);
    }
}
