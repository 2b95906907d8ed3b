//! Mock fetcher for tests
//!
//! Returns configurable values without touching the network.
//! Records every request (with its start instant) so tests can
//! assert on call counts and on concurrent execution overlap.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{HistoryPoint, ValueFetcher};
use crate::error::RunnerError;
use crate::task::RunningResult;

pub struct MockFetcher {
    name: String,
    /// FIFO queue of canned outcomes; falls back to `default` when empty.
    responses: Mutex<Vec<Result<RunningResult, String>>>,
    default: Result<RunningResult, String>,
    history: Option<Vec<HistoryPoint>>,
    /// Artificial latency, for overlap assertions.
    delay: Duration,
    /// (params, started-at) per call.
    calls: Arc<Mutex<Vec<(serde_json::Value, Instant)>>>,
}

impl MockFetcher {
    /// Always return the same decimal.
    pub fn returning(name: impl Into<String>, value: Decimal) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(vec![]),
            default: Ok(RunningResult::Decimal(value)),
            history: None,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Always fail with a fetch error.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(vec![]),
            default: Err(message.into()),
            history: None,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Queue one outcome; consumed in FIFO order before the default.
    pub fn queue(&self, outcome: Result<RunningResult, String>) {
        self.responses.lock().unwrap().push(outcome);
    }

    pub fn with_history(mut self, history: Vec<HistoryPoint>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Start instants of every call, in call order.
    pub fn call_starts(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl ValueFetcher for MockFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_value(&self, params: &serde_json::Value) -> Result<RunningResult, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((params.clone(), Instant::now()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let queued = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        match queued.unwrap_or_else(|| self.default.clone()) {
            Ok(value) => Ok(value),
            Err(message) => Err(RunnerError::Fetch(message)),
        }
    }

    async fn fetch_history(
        &self,
        params: &serde_json::Value,
    ) -> Result<Vec<HistoryPoint>, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((params.clone(), Instant::now()));

        match &self.history {
            Some(history) => Ok(history.clone()),
            None => Err(RunnerError::Fetch(format!(
                "client '{}' does not serve history",
                self.name
            ))),
        }
    }
}
