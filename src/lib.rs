//! Feedline - task-runner engine for oracle data feeds
//!
//! Interprets a declarative job definition (an ordered list of
//! typed tasks) and derives a single decimal or text value from
//! untrusted external sources. The caller owns scheduling and retry;
//! this engine owns dispatch, the execution context, sub-task
//! recursion, the shared TTL cache and socket pool, URL safety, and
//! the arbitrary-precision numeric primitives.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod jsonpath;
pub mod numeric;
pub mod runner;
pub mod safety;
pub mod socket;
pub mod task;

pub use cache::TtlCache;
pub use config::SafetyConfig;
pub use context::{ExecutionContext, SharedState};
pub use error::RunnerError;
pub use fetcher::{FetcherRegistry, MockFetcher, ValueFetcher};
pub use runner::JobRunner;
pub use socket::{Connectivity, SocketHandle, SocketKey, SocketPool};
pub use task::{Job, RoundMode, RunningResult, Task};
