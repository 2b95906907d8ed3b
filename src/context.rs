//! Per-job execution context
//!
//! Each job gets one context holding its private running result and
//! a handle to everything shared: the per-job variable cache, and
//! the process-wide registry of caches, pool, HTTP client and
//! fetchers. Shared collaborators are injected at construction;
//! there are no global singletons to reach for.
//!
//! Sub-task execution forks the context: the fork gets a fresh
//! running-result slot and shares everything else, so its lifetime
//! is bounded to the sub-job call while cache/pool references stay
//! process-wide.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::SafetyConfig;
use crate::error::RunnerError;
use crate::fetcher::FetcherRegistry;
use crate::socket::SocketPool;
use crate::task::RunningResult;

/// Entries the fetch-task memoization cache may hold.
const FETCH_CACHE_CAPACITY: usize = 512;

/// Socket idle TTL in normal execution.
const SOCKET_TTL: Duration = Duration::from_secs(120);
/// Socket idle TTL when simulating (shorter, per the simulation flag).
const SOCKET_TTL_SIMULATION: Duration = Duration::from_secs(30);

// ============================================================================
// SHARED STATE
// ============================================================================

/// Process-wide collaborators, built once and shared by every job.
pub struct SharedState {
    pub fetch_cache: TtlCache<String, RunningResult>,
    pub socket_pool: SocketPool,
    pub fetchers: FetcherRegistry,
    pub http: reqwest::Client,
    pub safety: SafetyConfig,
}

impl SharedState {
    pub fn new(fetchers: FetcherRegistry, safety: SafetyConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(safety.response_timeout)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("feedline/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");

        Arc::new(Self {
            fetch_cache: TtlCache::new(FETCH_CACHE_CAPACITY),
            socket_pool: SocketPool::new(),
            fetchers,
            http,
            safety,
        })
    }
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// Mutable per-job state threaded through the dispatcher.
pub struct ExecutionContext {
    /// The value produced by the most recent task, if any.
    result: Option<RunningResult>,

    /// Per-job variable cache, shared across forks of the same job.
    /// Written only by the cache task handler, after all of its
    /// sub-jobs succeeded.
    vars: Arc<RwLock<HashMap<String, RunningResult>>>,

    shared: Arc<SharedState>,

    /// Simulation runs use shorter TTLs and waits.
    simulation: bool,
}

impl ExecutionContext {
    pub fn new(shared: Arc<SharedState>, simulation: bool) -> Self {
        Self {
            result: None,
            vars: Arc::new(RwLock::new(HashMap::new())),
            shared,
            simulation,
        }
    }

    /// Fork for sub-task execution: independent running-result slot,
    /// shared variable cache and collaborators.
    pub fn fork(&self) -> Self {
        Self {
            result: None,
            vars: Arc::clone(&self.vars),
            shared: Arc::clone(&self.shared),
            simulation: self.simulation,
        }
    }

    pub fn result(&self) -> Option<&RunningResult> {
        self.result.as_ref()
    }

    /// The running result, or `MissingInput` for tasks that need one.
    pub fn require_result(&self) -> Result<&RunningResult, RunnerError> {
        self.result.as_ref().ok_or(RunnerError::MissingInput)
    }

    pub fn set_result(&mut self, result: RunningResult) {
        self.result = Some(result);
    }

    pub fn take_result(self) -> Option<RunningResult> {
        self.result
    }

    pub fn variable(&self, name: &str) -> Result<RunningResult, RunnerError> {
        self.vars
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// Publish a batch of variables at once, so concurrent siblings
    /// never observe a partial assignment.
    pub fn publish_variables(&self, batch: Vec<(String, RunningResult)>) {
        let mut vars = self.vars.write().unwrap();
        for (name, value) in batch {
            vars.insert(name, value);
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn simulation(&self) -> bool {
        self.simulation
    }

    /// Socket idle TTL for this execution mode.
    pub fn socket_ttl(&self) -> Duration {
        if self.simulation {
            SOCKET_TTL_SIMULATION
        } else {
            SOCKET_TTL
        }
    }

    /// Websocket wait budget: halved in simulation.
    pub fn socket_wait(&self, requested: Duration) -> Duration {
        if self.simulation {
            requested / 2
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn context() -> ExecutionContext {
        let shared = SharedState::new(FetcherRegistry::new(), SafetyConfig::default());
        ExecutionContext::new(shared, false)
    }

    #[test]
    fn fork_has_independent_result() {
        let mut ctx = context();
        ctx.set_result(RunningResult::Decimal(Decimal::ONE));

        let fork = ctx.fork();
        assert!(fork.result().is_none());
        assert!(ctx.result().is_some());
    }

    #[test]
    fn variables_are_shared_with_forks() {
        let ctx = context();
        let fork = ctx.fork();

        assert!(matches!(
            fork.variable("a"),
            Err(RunnerError::UnknownVariable { .. })
        ));

        ctx.publish_variables(vec![("a".to_string(), RunningResult::Decimal(Decimal::TWO))]);
        assert_eq!(
            fork.variable("a").unwrap(),
            RunningResult::Decimal(Decimal::TWO)
        );
    }

    #[test]
    fn simulation_shortens_waits() {
        let shared = SharedState::new(FetcherRegistry::new(), SafetyConfig::default());
        let normal = ExecutionContext::new(Arc::clone(&shared), false);
        let sim = ExecutionContext::new(shared, true);

        assert!(sim.socket_ttl() < normal.socket_ttl());
        let requested = Duration::from_secs(4);
        assert_eq!(sim.socket_wait(requested), Duration::from_secs(2));
        assert_eq!(normal.socket_wait(requested), requested);
    }
}
