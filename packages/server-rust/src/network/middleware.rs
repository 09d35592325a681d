//! HTTP-level Tower middleware applied in front of the request pipeline.
//!
//! Outermost first: request id, tracing, CORS, body limit, request id propagation.
//! Compression and timeouts are handled by the request pipeline itself.

use axum::body::Body;
use axum::http::header::{HeaderName, CACHE_CONTROL, CONTENT_TYPE, PRAGMA, USER_AGENT};
use axum::http::Method;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::{RequestBodyLimitLayer, ResponseBody};
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use crate::service::TOKEN_HEADER;

type LimitBodyToBody = fn(ResponseBody<Body>) -> Body;

type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        RequestBodyLimitLayer,
        tower::layer::util::Stack<
            MapResponseBodyLayer<LimitBodyToBody>,
            tower::layer::util::Stack<
                CorsLayer,
                tower::layer::util::Stack<
                    TraceLayer<
                        tower_http::classify::SharedClassifier<
                            tower_http::classify::ServerErrorsAsFailures,
                        >,
                    >,
                    tower::layer::util::Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        tower::layer::util::Identity,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the transport middleware stack.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.cors_origins))
        // Type adapter only: CORS needs a `Default` response body.
        .layer(MapResponseBodyLayer::new(Body::new as LimitBodyToBody))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// CORS for browser clients: the identity token travels in a custom header,
/// so it must be allowed explicitly.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            CACHE_CONTROL,
            PRAGMA,
            USER_AGENT,
            HeaderName::from_static(TOKEN_HEADER),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_build_with_defaults() {
        let _layers = build_http_layers(&NetworkConfig::default());
    }

    #[test]
    fn cors_with_specific_origins() {
        let origins = vec![
            "http://localhost:3000".to_string(),
            "not a valid origin\n".to_string(),
        ];
        let _cors = build_cors_layer(&origins);
    }
}
