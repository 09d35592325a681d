//! Tower middleware layers for the request pipeline.
//!
//! - [`timeout`]: Per-request timeout enforcement and cancellation
//! - [`metrics`]: Request spans, counters, and duration histograms
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes the layers around the executor

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_pipeline;
pub use timeout::TimeoutLayer;
