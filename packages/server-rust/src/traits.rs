use apiflow_core::Identity;
use async_trait::async_trait;
use tracing::error;

use crate::service::operation::Failure;

/// Resolves the caller behind an identity token.
/// Implementations: session store lookups, JWT verification, fixed identities (tests).
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns `Ok(None)` when the token is absent, unknown, or expired.
    ///
    /// Storage breakage must surface as `Failure::Infrastructure`.
    async fn resolve(&self, token: Option<&str>) -> Result<Option<Identity>, Failure>;
}

/// Resolver for deployments without authentication: every caller is anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl IdentityResolver for Anonymous {
    async fn resolve(&self, _token: Option<&str>) -> Result<Option<Identity>, Failure> {
        Ok(None)
    }
}

/// Opens the unit of work an endpoint runs inside.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    async fn begin_atomic(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

/// An open unit of work.
///
/// Dropping a transaction without committing it must roll it back; a
/// cancelled request never reaches `commit` or `rollback`.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Provider for deployments without a transactional store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransactions;

struct NoopTransaction;

#[async_trait]
impl TransactionProvider for NoTransactions {
    async fn begin_atomic(&self) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction))
    }
}

#[async_trait]
impl Transaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a reporter learns about a fatal request.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub node_id: String,
    pub call_id: u64,
    pub method: String,
    pub uri: String,
    pub token: Option<String>,
    /// Request body, truncated for transport to chat/mail sinks.
    pub body: String,
    /// Full error chain.
    pub error: String,
}

/// Delivers fatal-failure reports to operators.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, ctx: &FailureContext);
}

/// Reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl FailureReporter for LogReporter {
    async fn report(&self, ctx: &FailureContext) {
        error!(
            node_id = %ctx.node_id,
            call_id = ctx.call_id,
            method = %ctx.method,
            uri = %ctx.uri,
            body = %ctx.body,
            error = %ctx.error,
            "fatal request failure"
        );
    }
}

/// Reacts to an unrecoverable failure after it has been reported.
pub trait FatalHandler: Send + Sync {
    fn terminate(&self, ctx: &FailureContext);
}

/// Exits the process with status 1 so the supervisor restarts it with fresh connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn terminate(&self, ctx: &FailureContext) {
        error!(call_id = ctx.call_id, "terminating after infrastructure failure");
        std::process::exit(1);
    }
}
