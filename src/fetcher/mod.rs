//! Pluggable external value fetchers
//!
//! Protocol-specific task kinds (DEX price calculators, chain RPC
//! readers, on-chain account decoders) sit behind one contract: give
//! the client its parameters, get back a value. The engine treats
//! every fetcher as an opaque, fallible, asynchronous operation with
//! no special-cased retry.
//!
//! Fetchers are registered by name; a fetch task referencing an
//! unregistered name fails with `UnknownClient`.

mod mock;

pub use mock::MockFetcher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::task::RunningResult;

/// A point-in-time sample: (unix seconds, value).
pub type HistoryPoint = (i64, rust_decimal::Decimal);

/// One external value source.
#[async_trait]
pub trait ValueFetcher: Send + Sync {
    /// Client name as registered.
    fn name(&self) -> &str;

    /// Fetch the current value for the given parameters.
    async fn fetch_value(&self, params: &serde_json::Value) -> Result<RunningResult, RunnerError>;

    /// Fetch timestamped history for aggregation tasks. Clients that
    /// only serve spot values keep the default.
    async fn fetch_history(
        &self,
        _params: &serde_json::Value,
    ) -> Result<Vec<HistoryPoint>, RunnerError> {
        Err(RunnerError::Fetch(format!(
            "client '{}' does not serve history",
            self.name()
        )))
    }
}

/// Immutable name → fetcher table, shared by every job in the
/// process. Built once at startup and injected into the execution
/// context; no global singleton.
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn ValueFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, fetcher: Arc<dyn ValueFetcher>) -> Self {
        self.fetchers.insert(fetcher.name().to_string(), fetcher);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ValueFetcher>, RunnerError> {
        self.fetchers
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownClient {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn registry_lookup() {
        let registry =
            FetcherRegistry::new().register(Arc::new(MockFetcher::returning("spot", Decimal::ONE)));

        let fetcher = registry.get("spot").unwrap();
        let value = fetcher.fetch_value(&serde_json::Value::Null).await.unwrap();
        assert_eq!(value, RunningResult::Decimal(Decimal::ONE));

        assert!(matches!(
            registry.get("missing"),
            Err(RunnerError::UnknownClient { .. })
        ));
    }

    #[tokio::test]
    async fn history_default_is_unsupported() {
        struct SpotOnly;

        #[async_trait]
        impl ValueFetcher for SpotOnly {
            fn name(&self) -> &str {
                "spot-only"
            }

            async fn fetch_value(
                &self,
                _params: &serde_json::Value,
            ) -> Result<RunningResult, RunnerError> {
                Ok(RunningResult::Decimal(Decimal::ONE))
            }
        }

        let err = SpotOnly
            .fetch_history(&serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Fetch(_)));
    }
}
