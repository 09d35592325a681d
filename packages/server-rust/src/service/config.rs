use std::str::FromStr;
use std::time::Duration;

/// Server-level configuration for the request pipeline.
///
/// Controls caching, compression, timeouts, concurrency limits, and
/// background task intervals.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier for this server node, attached to logs.
    pub node_id: String,
    /// Default lifetime of cached responses and in-flight placeholders.
    pub cache_ttl: Duration,
    /// Mixed into every request fingerprint so keys differ per deployment.
    pub request_secret: String,
    /// Gzip level for response bodies, 0 (off) to 9.
    pub compression_level: u32,
    /// Per-request budget before the task is cancelled with `#timeout`.
    pub request_timeout: Duration,
    /// Maximum number of in-flight requests before load shedding.
    pub max_concurrent_requests: u32,
    /// Interval between expired-entry sweeps of the in-memory cache.
    pub sweep_interval: Duration,
    /// Include infrastructure error details in 500 responses.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cache_ttl: Duration::from_secs(60),
            request_secret: String::new(),
            compression_level: 0,
            request_timeout: Duration::from_secs(30),
            max_concurrent_requests: 1000,
            sweep_interval: Duration::from_secs(60),
            debug: false,
        }
    }
}

/// Which callers share cached responses for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Every request executes.
    #[default]
    Disabled,
    /// Cached per identity token.
    User,
    /// Cached across all callers; the token is not part of the key.
    All,
}

impl CacheMode {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "disabled" => Ok(Self::Disabled),
            "user" => Ok(Self::User),
            "all" => Ok(Self::All),
            other => Err(format!("unknown cache mode: {other}")),
        }
    }
}

/// Caching and access rules attached to a registered endpoint.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub cache: CacheMode,
    /// Overrides `ServerConfig::cache_ttl` for this endpoint.
    pub ttl: Option<Duration>,
    /// Allow callers without a resolvable identity.
    pub anonymous: bool,
    /// Roles allowed to call the endpoint; empty means any role.
    pub roles: Vec<String>,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            cache: CacheMode::Disabled,
            ttl: None,
            anonymous: true,
            roles: Vec::new(),
        }
    }
}

impl EndpointPolicy {
    /// Policy for endpoints that require a resolved identity.
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            anonymous: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cached(mut self, mode: CacheMode, ttl: Option<Duration>) -> Self {
        self.cache = mode;
        self.ttl = ttl;
        self
    }

    /// Restricts the endpoint to the given roles. Implies authentication.
    #[must_use]
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self.anonymous = false;
        self
    }

    #[must_use]
    pub fn allows_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == role)
    }
}
