//! Endpoint routing: resolves `(endpoint, version, method)` to a registered endpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use apiflow_core::ApiError;
use http::Method;

use super::config::EndpointPolicy;
use super::operation::Endpoint;

/// A registered endpoint with its access and caching policy.
#[derive(Clone)]
pub struct Route {
    pub endpoint: Arc<dyn Endpoint>,
    pub policy: EndpointPolicy,
    /// Version the endpoint was registered under; may be below the requested one.
    pub version: u32,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("policy", &self.policy)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Routing table keyed by endpoint name, then version, then method.
///
/// A request for version `n` is served by the highest registered version not
/// above `n`, so endpoints carry forward until a newer version replaces them.
#[derive(Default, Debug)]
pub struct EndpointRouter {
    routes: HashMap<String, BTreeMap<u32, HashMap<Method, Route>>>,
}

impl EndpointRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. `name` is the path after the version prefix,
    /// without digits, e.g. `"users/posts"`.
    pub fn register(
        &mut self,
        name: &str,
        version: u32,
        method: Method,
        policy: EndpointPolicy,
        endpoint: impl Endpoint,
    ) -> &mut Self {
        let route = Route {
            endpoint: Arc::new(endpoint),
            policy,
            version,
        };
        self.routes
            .entry(name.trim_matches('/').to_string())
            .or_default()
            .entry(version)
            .or_default()
            .insert(method, route);
        self
    }

    /// Resolves a request to its route.
    ///
    /// # Errors
    ///
    /// `NotFound` when no version at or below `version` registers the
    /// endpoint; `MethodNotAllowed` when the resolved version lacks `method`.
    pub fn resolve(&self, name: &str, version: u32, method: &Method) -> Result<&Route, ApiError> {
        let not_found = || ApiError::NotFound(format!("no such endpoint: v{version}/{name}"));
        let versions = self.routes.get(name).ok_or_else(not_found)?;
        let (_, methods) = versions.range(..=version).next_back().ok_or_else(not_found)?;
        methods.get(method).ok_or(ApiError::MethodNotAllowed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
