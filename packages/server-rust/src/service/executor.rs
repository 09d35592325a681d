//! The execution wrapper: cache lookup, placeholder reservation, authorization,
//! atomic execution, result write-back, failure classification, and the
//! fatal path.
//!
//! [`Executor`] is the innermost `tower::Service<ApiRequest>` of the pipeline.
//! It always answers with a [`Reply`]: client errors become error envelopes,
//! infrastructure failures are reported, handed to the [`FatalHandler`], and
//! answered with a 500.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use apiflow_core::{ApiError, Identity, RequestInput};
use bytes::Bytes;
use tokio::task::{JoinError, JoinHandle};
use tower::Service;
use tracing::{debug, error, warn};

use super::config::{EndpointPolicy, ServerConfig};
use super::lifecycle::{Lifecycle, Stage};
use super::operation::{ApiRequest, Failure, Invocation, RequestContext};
use super::router::{EndpointRouter, Route};
use crate::cache::{DedupCache, Lookup, Reservation};
use crate::envelope::{Payload, Reply};
use crate::traits::{
    Anonymous, ExitProcess, FailureContext, FailureReporter, FatalHandler, IdentityResolver,
    LogReporter, NoTransactions, TransactionProvider,
};

/// Longest request body forwarded to failure reports.
const REPORT_BODY_LIMIT: usize = 4096;

type BoxedFuture = Pin<Box<dyn Future<Output = Result<Reply, Failure>> + Send>>;

// ---------------------------------------------------------------------------
// AbortOnDrop
// ---------------------------------------------------------------------------

/// Aborts the endpoint task when the request future is dropped (timeout,
/// client disconnect), so the task and its transaction do not outlive the request.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<unknown panic>".to_string()),
        Err(err) => err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct Shared {
    config: Arc<ServerConfig>,
    router: EndpointRouter,
    cache: Option<DedupCache>,
    identities: Arc<dyn IdentityResolver>,
    transactions: Arc<dyn TransactionProvider>,
    reporter: Arc<dyn FailureReporter>,
    fatal: Arc<dyn FatalHandler>,
}

/// Innermost service of the request pipeline.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

/// Builder for [`Executor`]. Collaborators default to no caching, anonymous
/// callers, no transactions, a logging reporter, and process exit on fatal errors.
pub struct ExecutorBuilder {
    config: Arc<ServerConfig>,
    router: EndpointRouter,
    cache: Option<DedupCache>,
    identities: Arc<dyn IdentityResolver>,
    transactions: Arc<dyn TransactionProvider>,
    reporter: Arc<dyn FailureReporter>,
    fatal: Arc<dyn FatalHandler>,
}

impl ExecutorBuilder {
    #[must_use]
    pub fn cache(mut self, cache: DedupCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn identities(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identities = resolver;
        self
    }

    #[must_use]
    pub fn transactions(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.transactions = provider;
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn fatal(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = handler;
        self
    }

    #[must_use]
    pub fn build(self) -> Executor {
        Executor {
            shared: Arc::new(Shared {
                config: self.config,
                router: self.router,
                cache: self.cache,
                identities: self.identities,
                transactions: self.transactions,
                reporter: self.reporter,
                fatal: self.fatal,
            }),
        }
    }
}

impl Executor {
    #[must_use]
    pub fn builder(config: Arc<ServerConfig>, router: EndpointRouter) -> ExecutorBuilder {
        ExecutorBuilder {
            config,
            router,
            cache: None,
            identities: Arc::new(Anonymous),
            transactions: Arc::new(NoTransactions),
            reporter: Arc::new(LogReporter),
            fatal: Arc::new(ExitProcess),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl Service<ApiRequest> for Executor {
    type Response = Reply;
    type Error = Failure;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move { Ok(shared.handle(req).await) })
    }
}

/// Checks the caller against the endpoint's policy.
fn authorize(policy: &EndpointPolicy, identity: Option<Identity>) -> Result<Option<Identity>, ApiError> {
    match identity {
        None if !policy.anonymous || !policy.roles.is_empty() => {
            Err(ApiError::AccessDenied("#auth #token Token invalid".to_string()))
        }
        Some(identity) if !policy.allows_role(&identity.role) => {
            Err(ApiError::AccessDenied("#auth You shall not pass".to_string()))
        }
        identity => Ok(identity),
    }
}

impl Shared {
    async fn handle(&self, req: ApiRequest) -> Reply {
        let mut lifecycle = Lifecycle::new(req.ctx.call_id);
        let ctx = req.ctx.clone();
        let body = req.body.clone();

        let reply = match self.process(&mut lifecycle, req).await {
            Ok(reply) => reply,
            Err(Failure::Client(err)) => Reply::error(&err),
            Err(Failure::Infrastructure(err)) => self.fatal_path(&ctx, &body, &err).await,
        };
        self.emit(&mut lifecycle, &ctx, &body, reply).await
    }

    /// Marks the reply as sent. A second emission is a pipeline bug and
    /// replaces the reply with the fatal path's.
    async fn emit(&self, lc: &mut Lifecycle, ctx: &RequestContext, body: &Bytes, reply: Reply) -> Reply {
        match lc.respond() {
            Ok(()) => reply,
            Err(err) => {
                let err = anyhow::Error::new(err).context(format!("lifecycle violation at {}", lc.stage()));
                self.fatal_path(ctx, body, &err).await
            }
        }
    }

    async fn process(&self, lc: &mut Lifecycle, req: ApiRequest) -> Result<Reply, Failure> {
        let route = self
            .router
            .resolve(&req.ctx.endpoint, req.ctx.version, &req.ctx.method)?
            .clone();
        let ttl = route.policy.ttl.unwrap_or(self.config.cache_ttl);

        let cache = self
            .cache
            .as_ref()
            .filter(|_| route.policy.cache.is_enabled() && !req.ctx.no_cache);

        let Some(cache) = cache else {
            return self.authorize_and_run(lc, &route, req).await;
        };

        lc.advance(Stage::CacheCheck).map_err(Failure::infrastructure)?;
        let key = cache.key_for(&req.ctx, &req.body, route.policy.cache);
        match cache.fetch(&key).await {
            Lookup::InFlight => return Err(ApiError::DuplicateRequest.into()),
            Lookup::Ready(bytes) => match serde_json::from_slice::<Reply>(&bytes) {
                Ok(reply) => {
                    lc.advance(Stage::CacheHit).map_err(Failure::infrastructure)?;
                    debug!(call_id = req.ctx.call_id, "served from cache");
                    metrics::counter!("apiflow_cache_hits_total").increment(1);
                    return Ok(reply);
                }
                // Undecodable entries count as a miss and must be reserved like one.
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding undecodable cached reply");
                    if let Err(err) = cache.delete(&key).await {
                        warn!(key = %key, error = %err, "failed to discard cached reply");
                    }
                }
            },
            Lookup::Missing => {}
        }

        lc.advance(Stage::Reserve).map_err(Failure::infrastructure)?;
        let owned_key = match cache.reserve(&key, ttl).await {
            Reservation::Acquired => Some(key),
            Reservation::Held => return Err(ApiError::DuplicateRequest.into()),
            Reservation::Unavailable => None,
        };

        let outcome = self.authorize_and_run(lc, &route, req).await;
        if let Some(key) = owned_key {
            match &outcome {
                Ok(reply) if reply.is_success() => {
                    lc.advance(Stage::StoreResult).map_err(Failure::infrastructure)?;
                    match serde_json::to_vec(reply) {
                        Ok(bytes) => cache.complete(&key, ttl, &bytes).await,
                        Err(err) => warn!(key = %key, error = %err, "reply not cacheable"),
                    }
                }
                // The abandoned task may still be unwinding; the TTL releases the key.
                Err(Failure::Client(ApiError::Cancelled)) => {}
                // Release the placeholder so a corrected retry is not a duplicate.
                Ok(_) | Err(Failure::Client(_)) => {
                    if let Err(err) = cache.delete(&key).await {
                        warn!(key = %key, error = %err, "failed to release placeholder");
                    }
                }
                Err(Failure::Infrastructure(_)) => {}
            }
        }
        outcome
    }

    async fn authorize_and_run(
        &self,
        lc: &mut Lifecycle,
        route: &Route,
        req: ApiRequest,
    ) -> Result<Reply, Failure> {
        lc.advance(Stage::Authorize).map_err(Failure::infrastructure)?;
        let resolved = self.identities.resolve(req.ctx.token.as_deref()).await?;
        let identity = match authorize(&route.policy, resolved) {
            Ok(identity) => identity,
            Err(err) => {
                lc.advance(Stage::Rejected).map_err(Failure::infrastructure)?;
                return Err(err.into());
            }
        };
        lc.advance(Stage::Authorized).map_err(Failure::infrastructure)?;

        lc.advance(Stage::Execute).map_err(Failure::infrastructure)?;
        let input = RequestInput::parse(req.query, &req.body)?;
        let inv = Invocation {
            ctx: req.ctx,
            input,
            identity,
        };
        let payload = self.run_atomic(route, inv).await?;
        Ok(Reply::payload(payload))
    }

    /// Runs the endpoint as a spawned task inside a transaction.
    ///
    /// The transaction commits on success and rolls back on any error. A
    /// cancelled or dropped request aborts the task, dropping the transaction.
    async fn run_atomic(&self, route: &Route, inv: Invocation) -> Result<Payload, Failure> {
        let tx = self
            .transactions
            .begin_atomic()
            .await
            .map_err(Failure::Infrastructure)?;
        let cancel = inv.ctx.cancel.clone();
        let call_id = inv.ctx.call_id;
        let endpoint = Arc::clone(&route.endpoint);

        let mut task = AbortOnDrop(tokio::spawn(async move {
            let outcome = endpoint.call(inv).await;
            match &outcome {
                Ok(_) => tx.commit().await.map_err(Failure::Infrastructure)?,
                Err(_) => {
                    if let Err(err) = tx.rollback().await {
                        warn!(call_id, error = %err, "rollback failed");
                    }
                }
            }
            outcome
        }));

        tokio::select! {
            () = cancel.cancelled() => {
                debug!(call_id, "request cancelled");
                Err(ApiError::Cancelled.into())
            }
            joined = &mut task.0 => match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => Err(Failure::Infrastructure(anyhow::anyhow!(
                    "endpoint panicked: {}",
                    panic_message(err)
                ))),
                Err(err) => Err(Failure::infrastructure(err)),
            },
        }
    }

    async fn fatal_path(&self, ctx: &RequestContext, body: &Bytes, err: &anyhow::Error) -> Reply {
        let error_text = format!("{err:#}");
        error!(call_id = ctx.call_id, uri = %ctx.uri, error = %error_text, "infrastructure failure");
        metrics::counter!("apiflow_fatal_failures_total").increment(1);

        let body_text = String::from_utf8_lossy(body);
        let report = FailureContext {
            node_id: self.config.node_id.clone(),
            call_id: ctx.call_id,
            method: ctx.method.to_string(),
            uri: ctx.uri.clone(),
            token: ctx.token.clone(),
            body: body_text.chars().take(REPORT_BODY_LIMIT).collect(),
            error: error_text.clone(),
        };
        self.reporter.report(&report).await;
        self.fatal.terminate(&report);

        Reply::internal(self.config.debug.then_some(error_text.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use apiflow_core::{Field, Object};
    use async_trait::async_trait;
    use http::Method;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::dedup::tests::BrokenStore;
    use crate::cache::MemoryStore;
    use crate::service::config::CacheMode;
    use crate::service::operation::{Endpoint, EndpointFn};
    use crate::traits::Transaction;

    // -- stub collaborators --------------------------------------------------

    #[derive(Clone, Default)]
    struct Calls(Arc<AtomicU32>);

    impl Calls {
        fn get(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Counting {
        calls: Calls,
        delay: Duration,
    }

    #[async_trait]
    impl Endpoint for Counting {
        async fn call(&self, _inv: Invocation) -> Result<Payload, Failure> {
            let n = self.calls.0.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            let mut data = Object::new();
            data.insert("n", i64::from(n));
            Ok(Payload::new(data))
        }
    }

    #[derive(Default)]
    struct RecordingFatal(Calls);

    impl FatalHandler for RecordingFatal {
        fn terminate(&self, _ctx: &FailureContext) {
            self.0 .0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingReporter(Mutex<Vec<FailureContext>>);

    #[async_trait]
    impl FailureReporter for RecordingReporter {
        async fn report(&self, ctx: &FailureContext) {
            self.0.lock().push(ctx.clone());
        }
    }

    #[derive(Default, Clone)]
    struct TxCounts {
        commits: Calls,
        rollbacks: Calls,
    }

    struct RecordingTx(TxCounts);

    #[async_trait]
    impl Transaction for RecordingTx {
        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            self.0.commits.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            self.0.rollbacks.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionProvider for TxCounts {
        async fn begin_atomic(&self) -> anyhow::Result<Box<dyn Transaction>> {
            Ok(Box::new(RecordingTx(self.clone())))
        }
    }

    struct Tokens(Calls);

    #[async_trait]
    impl IdentityResolver for Tokens {
        async fn resolve(&self, token: Option<&str>) -> Result<Option<Identity>, Failure> {
            self.0 .0.fetch_add(1, Ordering::SeqCst);
            Ok(match token {
                Some("admin") | Some("user") => Some(Identity {
                    id: "1".into(),
                    role: token.unwrap_or_default().into(),
                    profile: Object::new(),
                }),
                _ => None,
            })
        }
    }

    fn request(endpoint: &str, method: Method) -> ApiRequest {
        ApiRequest::new(RequestContext::new(1, method, 1, endpoint))
    }

    fn cache() -> DedupCache {
        DedupCache::new(Arc::new(MemoryStore::new()), "secret")
    }

    fn config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    fn counting_router(calls: &Calls, delay: Duration, policy: EndpointPolicy) -> EndpointRouter {
        let mut router = EndpointRouter::new();
        router.register(
            "items",
            1,
            Method::GET,
            policy,
            Counting {
                calls: calls.clone(),
                delay,
            },
        );
        router
    }

    // -- dedup ---------------------------------------------------------------

    #[tokio::test]
    async fn concurrent_identical_requests_execute_once() {
        let calls = Calls::default();
        let policy = EndpointPolicy::default().cached(CacheMode::All, None);
        let executor = Executor::builder(config(), counting_router(&calls, Duration::from_millis(100), policy))
            .cache(cache())
            .build();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let svc = executor.clone();
                tokio::spawn(async move { svc.oneshot(request("items", Method::GET)).await })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            let reply = task.await.unwrap().unwrap();
            if reply.is_success() {
                assert_eq!(reply.body["data"]["n"], 1);
                ok += 1;
            } else {
                assert_eq!(reply.error_code(), Some("#duplicate_request"));
            }
        }
        assert!(ok >= 1);
        assert_eq!(calls.get(), 1);

        let cached = executor.oneshot(request("items", Method::GET)).await.unwrap();
        assert_eq!(cached.body["data"]["n"], 1);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn no_cache_bypasses_lookup() {
        let calls = Calls::default();
        let policy = EndpointPolicy::default().cached(CacheMode::All, None);
        let executor = Executor::builder(config(), counting_router(&calls, Duration::ZERO, policy))
            .cache(cache())
            .build();

        executor.clone().oneshot(request("items", Method::GET)).await.unwrap();
        let mut bypass = request("items", Method::GET);
        bypass.ctx.no_cache = true;
        let reply = executor.oneshot(bypass).await.unwrap();
        assert_eq!(reply.body["data"]["n"], 2);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn cache_hit_skips_authorization() {
        let calls = Calls::default();
        let lookups = Calls::default();
        let policy = EndpointPolicy::authenticated().cached(CacheMode::User, None);
        let executor = Executor::builder(config(), counting_router(&calls, Duration::ZERO, policy))
            .cache(cache())
            .identities(Arc::new(Tokens(lookups.clone())))
            .build();

        let mut first = request("items", Method::GET);
        first.ctx.token = Some("user".into());
        let second = first.clone();

        assert!(executor.clone().oneshot(first).await.unwrap().is_success());
        assert!(executor.oneshot(second).await.unwrap().is_success());
        assert_eq!(lookups.get(), 1);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn broken_cache_executes_uncached() {
        let calls = Calls::default();
        let policy = EndpointPolicy::default().cached(CacheMode::All, None);
        let executor = Executor::builder(config(), counting_router(&calls, Duration::ZERO, policy))
            .cache(DedupCache::new(Arc::new(BrokenStore), "secret"))
            .build();

        for n in 1..=2 {
            let reply = executor.clone().oneshot(request("items", Method::GET)).await.unwrap();
            assert_eq!(reply.body["data"]["n"], n);
        }
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn client_error_releases_placeholder() {
        let calls = Calls::default();
        let mut router = EndpointRouter::new();
        let seen = calls.clone();
        router.register(
            "orders",
            1,
            Method::POST,
            EndpointPolicy::default().cached(CacheMode::All, None),
            EndpointFn(move |inv: Invocation| {
                let seen = seen.clone();
                async move {
                    seen.0.fetch_add(1, Ordering::SeqCst);
                    inv.input.body_field(&Field::new("sku").required())?;
                    Ok(Payload::message_only("ok"))
                }
            }),
        );
        let executor = Executor::builder(config(), router).cache(cache()).build();

        for _ in 0..2 {
            let reply = executor
                .clone()
                .oneshot(request("orders", Method::POST).with_body("{}"))
                .await
                .unwrap();
            assert_eq!(reply.error_code(), Some("#missing #field"));
        }
        assert_eq!(calls.get(), 2);
    }

    // -- authorization -------------------------------------------------------

    #[tokio::test]
    async fn anonymous_rejected_when_not_allowed() {
        let calls = Calls::default();
        let executor = Executor::builder(
            config(),
            counting_router(&calls, Duration::ZERO, EndpointPolicy::authenticated()),
        )
        .identities(Arc::new(Tokens(Calls::default())))
        .build();

        let reply = executor.oneshot(request("items", Method::GET)).await.unwrap();
        assert_eq!(reply.status, 401);
        assert_eq!(reply.error_code(), Some("#access_denied #auth #token"));
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test]
    async fn role_outside_policy_rejected() {
        let calls = Calls::default();
        let executor = Executor::builder(
            config(),
            counting_router(&calls, Duration::ZERO, EndpointPolicy::default().roles(["admin"])),
        )
        .identities(Arc::new(Tokens(Calls::default())))
        .build();

        let mut as_user = request("items", Method::GET);
        as_user.ctx.token = Some("user".into());
        assert_eq!(executor.clone().oneshot(as_user).await.unwrap().status, 401);

        let mut as_admin = request("items", Method::GET);
        as_admin.ctx.token = Some("admin".into());
        assert!(executor.oneshot(as_admin).await.unwrap().is_success());
        assert_eq!(calls.get(), 1);
    }

    // -- routing and input ---------------------------------------------------

    #[tokio::test]
    async fn unknown_endpoint_and_method() {
        let executor = Executor::builder(
            config(),
            counting_router(&Calls::default(), Duration::ZERO, EndpointPolicy::default()),
        )
        .build();

        let missing = executor.clone().oneshot(request("nope", Method::GET)).await.unwrap();
        assert_eq!(missing.status, 404);
        let wrong = executor.oneshot(request("items", Method::DELETE)).await.unwrap();
        assert_eq!(wrong.status, 405);
    }

    #[tokio::test]
    async fn malformed_body_is_client_error() {
        let calls = Calls::default();
        let executor = Executor::builder(
            config(),
            counting_router(&calls, Duration::ZERO, EndpointPolicy::default()),
        )
        .build();

        let reply = executor
            .oneshot(request("items", Method::GET).with_body("{oops"))
            .await
            .unwrap();
        assert_eq!(reply.status, 400);
        assert_eq!(reply.error_code(), Some("#json #parse"));
        assert_eq!(calls.get(), 0);
    }

    // -- transactions and the fatal path -------------------------------------

    fn failing_router(failure: fn() -> Result<Payload, Failure>) -> EndpointRouter {
        let mut router = EndpointRouter::new();
        router.register(
            "boom",
            1,
            Method::POST,
            EndpointPolicy::default(),
            EndpointFn(move |_inv: Invocation| async move { failure() }),
        );
        router
    }

    #[tokio::test]
    async fn success_commits_and_client_error_rolls_back() {
        let tx = TxCounts::default();
        let calls = Calls::default();
        let executor = Executor::builder(
            config(),
            counting_router(&calls, Duration::ZERO, EndpointPolicy::default()),
        )
        .transactions(Arc::new(tx.clone()))
        .build();
        executor.oneshot(request("items", Method::GET)).await.unwrap();
        assert_eq!(tx.commits.get(), 1);
        assert_eq!(tx.rollbacks.get(), 0);

        let tx = TxCounts::default();
        let executor = Executor::builder(
            config(),
            failing_router(|| Err(ApiError::declared("out of stock").into())),
        )
        .transactions(Arc::new(tx.clone()))
        .build();
        let reply = executor.oneshot(request("boom", Method::POST)).await.unwrap();
        assert_eq!(reply.status, 417);
        assert_eq!(tx.commits.get(), 0);
        assert_eq!(tx.rollbacks.get(), 1);
    }

    #[tokio::test]
    async fn infrastructure_failure_reports_and_terminates() {
        let fatal = Arc::new(RecordingFatal::default());
        let reporter = Arc::new(RecordingReporter::default());
        let tx = TxCounts::default();
        let executor = Executor::builder(
            config(),
            failing_router(|| Err(Failure::infrastructure(anyhow::anyhow!("connection reset")))),
        )
        .fatal(fatal.clone())
        .reporter(reporter.clone())
        .transactions(Arc::new(tx.clone()))
        .build();

        let reply = executor
            .oneshot(request("boom", Method::POST).with_body("{\"a\":1}"))
            .await
            .unwrap();
        assert_eq!(reply.status, 500);
        assert_eq!(fatal.0.get(), 1);
        assert_eq!(tx.rollbacks.get(), 1);

        let reports = reporter.0.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.contains("connection reset"));
        assert_eq!(reports[0].body, "{\"a\":1}");
    }

    #[tokio::test]
    async fn panic_takes_fatal_path() {
        let fatal = Arc::new(RecordingFatal::default());
        let executor = Executor::builder(config(), failing_router(|| panic!("bug")))
            .fatal(fatal.clone())
            .build();

        let reply = executor.oneshot(request("boom", Method::POST)).await.unwrap();
        assert_eq!(reply.status, 500);
        assert_eq!(fatal.0.get(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_without_commit() {
        let tx = TxCounts::default();
        let calls = Calls::default();
        let dedup = cache();
        let policy = EndpointPolicy::default().cached(CacheMode::All, None);
        let executor = Executor::builder(
            config(),
            counting_router(&calls, Duration::from_secs(30), policy),
        )
        .cache(dedup.clone())
        .transactions(Arc::new(tx.clone()))
        .build();

        let req = request("items", Method::GET);
        let key = dedup.key_for(&req.ctx, &req.body, CacheMode::All);
        let cancel = req.ctx.cancel.clone();
        let pending = tokio::spawn(executor.clone().oneshot(req));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.error_code(), Some("#cancelled"));
        assert_eq!(tx.commits.get(), 0);

        // The placeholder outlives the cancelled request until its TTL.
        assert_eq!(dedup.fetch(&key).await, Lookup::InFlight);
        let retry = executor.oneshot(request("items", Method::GET)).await.unwrap();
        assert_eq!(retry.error_code(), Some("#duplicate_request"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn undecodable_entry_is_reserved_before_executing() {
        let calls = Calls::default();
        let dedup = cache();
        let policy = EndpointPolicy::default().cached(CacheMode::All, None);
        let executor = Executor::builder(config(), counting_router(&calls, Duration::from_millis(100), policy))
            .cache(dedup.clone())
            .build();

        let seed = request("items", Method::GET);
        let key = dedup.key_for(&seed.ctx, &seed.body, CacheMode::All);
        dedup.complete(&key, Duration::from_secs(60), b"not json").await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let svc = executor.clone();
                tokio::spawn(async move { svc.oneshot(request("items", Method::GET)).await })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            let reply = task.await.unwrap().unwrap();
            if reply.is_success() {
                ok += 1;
            } else {
                assert_eq!(reply.error_code(), Some("#duplicate_request"));
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(calls.get(), 1);
        assert!(matches!(dedup.fetch(&key).await, Lookup::Ready(_)));
    }

    #[tokio::test]
    async fn second_emission_takes_fatal_path() {
        let fatal = Arc::new(RecordingFatal::default());
        let executor = Executor::builder(config(), EndpointRouter::new())
            .fatal(fatal.clone())
            .build();

        let req = request("items", Method::GET);
        let mut lc = Lifecycle::new(req.ctx.call_id);
        lc.respond().unwrap();

        let reply = executor
            .shared
            .emit(&mut lc, &req.ctx, &req.body, Reply::payload(Payload::message_only("ok")))
            .await;
        assert_eq!(reply.status, 500);
        assert_eq!(fatal.0.get(), 1);
    }

    #[test]
    fn authorize_table() {
        let admin = Identity {
            id: "1".into(),
            role: "admin".into(),
            profile: Object::new(),
        };
        assert!(authorize(&EndpointPolicy::default(), None).unwrap().is_none());
        assert!(authorize(&EndpointPolicy::authenticated(), None).is_err());
        assert!(authorize(&EndpointPolicy::default().roles(["admin"]), Some(admin.clone())).is_ok());
        assert!(authorize(&EndpointPolicy::default().roles(["staff"]), Some(admin)).is_err());
    }
}
