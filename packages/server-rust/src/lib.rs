//! apiflow server: request classification, dedup cache, atomic execution
//! wrapper, response envelope, and the HTTP transport around them.

pub mod cache;
pub mod envelope;
pub mod network;
pub mod service;
pub mod telemetry;
pub mod traits;

pub use envelope::{Payload, Reply};
pub use service::{
    build_pipeline, ApiRequest, CacheMode, Endpoint, EndpointFn, EndpointPolicy, EndpointRouter,
    Executor, Failure, Invocation, ServerConfig,
};
pub use traits::{
    FailureContext, FailureReporter, FatalHandler, IdentityResolver, Transaction,
    TransactionProvider,
};
