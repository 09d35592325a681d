//! Request routing and execution.
//!
//! 1. **Classification** (`classify`): request parts -> `ApiRequest`
//! 2. **Middleware** (`middleware`): Tower layers (metrics, load shedding, timeout)
//! 3. **Execution** (`executor`): cache, authorization, atomic endpoint call
//! 4. **Routing** (`router`): `(endpoint, version, method)` -> `Endpoint`
//! 5. **Background workers** (`worker`): periodic tasks such as cache sweeps

pub mod classify;
pub mod config;
pub mod executor;
pub mod lifecycle;
pub mod middleware;
pub mod operation;
pub mod router;
pub mod worker;

pub use classify::{parse_path, RequestClassifier, RoutePath, TOKEN_HEADER};
pub use config::{CacheMode, EndpointPolicy, ServerConfig};
pub use executor::{Executor, ExecutorBuilder};
pub use lifecycle::{Lifecycle, LifecycleError, Stage};
pub use middleware::build_pipeline;
pub use operation::{ApiRequest, Endpoint, EndpointFn, Failure, Invocation, RequestContext};
pub use router::{EndpointRouter, Route};
pub use worker::{BackgroundRunnable, BackgroundWorker};
