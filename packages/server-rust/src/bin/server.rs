//! apiflow demo server.
//!
//! Registers a few endpoints on the pipeline and serves them over HTTP:
//!
//! - `GET  /v1/hello?name=...`  greeting, cached for all callers
//! - `POST /v1/greetings`       validated body echo, deduplicated per caller
//! - `GET  /v1/whoami`          requires the admin token in `X-Token`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apiflow_core::{ApiError, Check, Coerce, Declarations, Field, Identity, Object, Schema};
use apiflow_server::cache::{CacheSweeper, DedupCache, MemoryStore};
use apiflow_server::network::{NetworkConfig, NetworkModule};
use apiflow_server::service::worker::BackgroundWorker;
use apiflow_server::telemetry::{init_tracing, install_metrics_exporter};
use apiflow_server::{
    CacheMode, EndpointFn, EndpointPolicy, EndpointRouter, Executor, Failure, IdentityResolver,
    Invocation, Payload, ServerConfig,
};
use async_trait::async_trait;
use clap::Parser;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "apiflow-server", version, about = "apiflow demo server")]
struct Args {
    #[arg(long, env = "APIFLOW_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "APIFLOW_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "APIFLOW_NODE_ID", default_value = "apiflow-1")]
    node_id: String,

    /// Mixed into request fingerprints.
    #[arg(long, env = "APIFLOW_SECRET", default_value = "")]
    secret: String,

    #[arg(long, env = "APIFLOW_CACHE_TTL_SECS", default_value_t = 60)]
    cache_ttl_secs: u64,

    /// Gzip level for responses, 0 disables compression.
    #[arg(long, env = "APIFLOW_COMPRESSION", default_value_t = 0)]
    compression_level: u32,

    #[arg(long, env = "APIFLOW_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    #[arg(long, env = "APIFLOW_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "APIFLOW_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Token accepted for the `admin` identity.
    #[arg(long, env = "APIFLOW_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Shared Redis cache instead of the in-process store.
    #[cfg(feature = "redis")]
    #[arg(long, env = "APIFLOW_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "APIFLOW_LOG_JSON")]
    log_json: bool,

    /// Expose infrastructure error details in 500 replies.
    #[arg(long, env = "APIFLOW_DEBUG")]
    debug: bool,
}

// ---------------------------------------------------------------------------
// Demo endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
    times: i64,
    #[serde(default)]
    tone: Option<String>,
}

impl Schema for Greeting {
    fn declare(d: &mut Declarations<'_>) -> Result<(), ApiError> {
        d.declare(Field::new("name").coerce(Coerce::string()).required())?;
        d.declare(
            Field::new("times")
                .coerce(Coerce::int())
                .check(Check::predicate(|v| v.as_i64().is_some_and(|n| (1..=10).contains(&n))))
                .default(1),
        )?;
        d.declare(
            Field::new("tone")
                .coerce(Coerce::string())
                .check(Check::one_of(["plain", "loud"])),
        )
    }
}

async fn hello(inv: Invocation) -> Result<Payload, Failure> {
    let name = inv.input.arg(&Field::new("name").coerce(Coerce::string()).default("world"))?;
    let mut data = Object::new();
    data.insert("greeting", format!("hello, {name}"));
    Ok(Payload::new(data))
}

async fn greetings(inv: Invocation) -> Result<Payload, Failure> {
    let greeting: Greeting = inv.input.body_as()?;
    info!(call_id = inv.ctx.call_id, name = %greeting.name, "greeting accepted");
    Ok(Payload::of(&greeting).with_status(201))
}

async fn whoami(inv: Invocation) -> Result<Payload, Failure> {
    let me = inv.me()?;
    let mut data = Object::new();
    data.insert("id", me.id.as_str());
    data.insert("role", me.role.as_str());
    Ok(Payload::new(data))
}

fn routes() -> EndpointRouter {
    let mut router = EndpointRouter::new();
    router
        .register(
            "hello",
            1,
            Method::GET,
            EndpointPolicy::default().cached(CacheMode::All, None),
            EndpointFn(hello),
        )
        .register(
            "greetings",
            1,
            Method::POST,
            EndpointPolicy::default().cached(CacheMode::User, Some(Duration::from_secs(10))),
            EndpointFn(greetings),
        )
        .register(
            "whoami",
            1,
            Method::GET,
            EndpointPolicy::default().roles(["admin"]),
            EndpointFn(whoami),
        );
    router
}

/// Accepts one configured token as the `admin` identity.
struct AdminToken(Option<String>);

#[async_trait]
impl IdentityResolver for AdminToken {
    async fn resolve(&self, token: Option<&str>) -> Result<Option<Identity>, Failure> {
        let matches = matches!((&self.0, token), (Some(expected), Some(given)) if expected == given);
        Ok(matches.then(|| Identity {
            id: "admin".to_string(),
            role: "admin".to_string(),
            profile: Object::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;
    if let Some(addr) = args.metrics_addr {
        install_metrics_exporter(addr)?;
    }

    let config = Arc::new(ServerConfig {
        node_id: args.node_id.clone(),
        cache_ttl: Duration::from_secs(args.cache_ttl_secs),
        request_secret: args.secret.clone(),
        compression_level: args.compression_level,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        max_concurrent_requests: args.max_concurrent,
        debug: args.debug,
        ..ServerConfig::default()
    });

    let memory = Arc::new(MemoryStore::new());
    #[cfg(feature = "redis")]
    let store: Arc<dyn apiflow_server::cache::CacheStore> = match &args.redis_url {
        Some(url) => Arc::new(apiflow_server::cache::RedisStore::connect(url).await?),
        None => Arc::clone(&memory) as _,
    };
    #[cfg(not(feature = "redis"))]
    let store: Arc<dyn apiflow_server::cache::CacheStore> = Arc::clone(&memory) as _;

    let executor = Executor::builder(Arc::clone(&config), routes())
        .cache(DedupCache::new(store, config.request_secret.clone()))
        .identities(Arc::new(AdminToken(args.admin_token.clone())))
        .build();

    let network = NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, Arc::clone(&config), executor);
    let port = module.start().await?;

    let shutdown = module.shutdown_controller();
    let mut sweeper = BackgroundWorker::start(
        CacheSweeper::new(memory),
        config.sweep_interval,
        &shutdown.token(),
    );

    info!(node_id = %config.node_id, port, "apiflow server started");
    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    sweeper.stop().await;
    info!("apiflow server stopped");
    Ok(())
}
