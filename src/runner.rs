//! Job dispatcher
//!
//! Tasks execute strictly in order; each handler reads the current
//! running result plus its own parameters and overwrites the running
//! result on success. Any handler failure is wrapped with the task
//! type and a serialized snapshot of its parameters, then aborts the
//! rest of the job; no partial continuation, no retry at this
//! layer. The two structured recursion patterns are the conditional
//! (attempt, then fallback on failure) and the cache task (named
//! sub-jobs running concurrently on independent context forks).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{join_all, BoxFuture};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::context::{ExecutionContext, SharedState};
use crate::error::RunnerError;
use crate::http;
use crate::jsonpath;
use crate::numeric;
use crate::safety;
use crate::socket::{Connectivity, SocketKey};
use crate::task::{
    AggregateDef, BoundDef, CacheDef, ConditionalDef, EmaDef, FetchDef, HttpDef, Job, Operand,
    RoundDef, RunningResult, Task, WebsocketDef,
};

use std::sync::Arc;

/// Executes job definitions against a shared-state arena.
pub struct JobRunner {
    shared: Arc<SharedState>,
    simulation: bool,
}

impl JobRunner {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            simulation: false,
        }
    }

    /// A simulating runner uses shorter socket TTLs and waits.
    pub fn simulating(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            simulation: true,
        }
    }

    /// Run a job to completion and return its final running result.
    #[instrument(skip(self, job, initial), fields(tasks = job.tasks.len()))]
    pub async fn execute(
        &self,
        job: &Job,
        initial: Option<RunningResult>,
    ) -> Result<RunningResult, RunnerError> {
        let mut ctx = ExecutionContext::new(Arc::clone(&self.shared), self.simulation);
        if let Some(initial) = initial {
            ctx.set_result(initial);
        }
        self.execute_tasks(&mut ctx, &job.tasks).await?;
        ctx.take_result().ok_or(RunnerError::MissingInput)
    }

    /// Sequential task loop; boxed so sub-jobs can recurse into it.
    fn execute_tasks<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        tasks: &'a [Task],
    ) -> BoxFuture<'a, Result<(), RunnerError>> {
        Box::pin(async move {
            if tasks.is_empty() {
                return Err(RunnerError::definition("job", "task list is empty"));
            }
            for task in tasks {
                self.execute_task(ctx, task).await?;
            }
            Ok(())
        })
    }

    /// Fork the parent context and run a sub-job against the fork,
    /// returning the fork's final running result.
    async fn run_sub_tasks(
        &self,
        parent: &ExecutionContext,
        tasks: &[Task],
    ) -> Result<RunningResult, RunnerError> {
        self.run_fork(parent.fork(), tasks).await
    }

    async fn run_fork(
        &self,
        mut fork: ExecutionContext,
        tasks: &[Task],
    ) -> Result<RunningResult, RunnerError> {
        self.execute_tasks(&mut fork, tasks).await?;
        fork.take_result().ok_or(RunnerError::MissingInput)
    }

    /// Dispatch one task and wrap any failure with the task type and
    /// its serialized parameters.
    #[instrument(skip(self, ctx, task), fields(task = task.kind()))]
    async fn execute_task(
        &self,
        ctx: &mut ExecutionContext,
        task: &Task,
    ) -> Result<(), RunnerError> {
        debug!("executing task");
        let outcome = match task {
            Task::Value { value } => {
                ctx.set_result(RunningResult::Decimal(value.value));
                Ok(())
            }
            Task::Http { http } => self.handle_http(ctx, http).await,
            Task::Websocket { websocket } => self.handle_websocket(ctx, websocket).await,
            Task::Fetch { fetch } => self.handle_fetch(ctx, fetch).await,
            Task::Cache { cache } => self.handle_cache(ctx, cache).await,
            Task::Conditional { conditional } => self.handle_conditional(ctx, conditional).await,
            Task::Round { round } => self.handle_round(ctx, round),
            Task::Bound { bound } => self.handle_bound(ctx, bound),
            Task::Add { add } => self.handle_arithmetic(ctx, add, numeric::add).await,
            Task::Subtract { subtract } => {
                self.handle_arithmetic(ctx, subtract, numeric::subtract).await
            }
            Task::Multiply { multiply } => {
                self.handle_arithmetic(ctx, multiply, numeric::multiply).await
            }
            Task::Divide { divide } => self.handle_arithmetic(ctx, divide, numeric::divide).await,
            Task::Pow { pow } => self.handle_arithmetic(ctx, pow, numeric::pow).await,
            Task::Max { max } => self.handle_aggregate(ctx, max, numeric::max).await,
            Task::Min { min } => self.handle_aggregate(ctx, min, numeric::min).await,
            Task::Mean { mean } => self.handle_aggregate(ctx, mean, numeric::mean).await,
            Task::Median { median } => self.handle_aggregate(ctx, median, numeric::median).await,
            Task::Range { range } => self.handle_aggregate(ctx, range, numeric::range).await,
            Task::Ema { ema } => self.handle_ema(ctx, ema).await,
            Task::JsonPath { json_path } => self.handle_json_path(ctx, &json_path.path),
            Task::RegexExtract { regex_extract } => {
                self.handle_regex(ctx, &regex_extract.pattern, regex_extract.group)
            }
        };

        outcome.map_err(|e| RunnerError::task(task.kind(), task, e))
    }

    // ─────────────────────────────────────────────────────────────
    // Network handlers
    // ─────────────────────────────────────────────────────────────

    async fn handle_http(
        &self,
        ctx: &mut ExecutionContext,
        def: &HttpDef,
    ) -> Result<(), RunnerError> {
        let body = http::fetch_url(
            &self.shared.http,
            &def.url,
            &def.headers,
            &self.shared.safety,
        )
        .await?;
        ctx.set_result(RunningResult::Text(body));
        Ok(())
    }

    async fn handle_websocket(
        &self,
        ctx: &mut ExecutionContext,
        def: &WebsocketDef,
    ) -> Result<(), RunnerError> {
        let url = safety::verify(&def.url, &self.shared.safety)?;
        let key = SocketKey::new(&url, &def.subscription);
        let (handle, created) = self
            .shared
            .socket_pool
            .get_or_create(key.clone(), ctx.socket_ttl());

        if created {
            tokio::spawn(crate::socket::drive(
                Arc::clone(&handle),
                url,
                def.subscription.clone(),
            ));
        } else if handle.is_stale() {
            // Never silently reconnect mid-task: evict and fail.
            self.shared.socket_pool.evict(&key);
            return Err(RunnerError::StaleSocket {
                key: key.to_string(),
            });
        } else if handle.connectivity() == Connectivity::Closed {
            // A dead connection must not soak up wait budgets until
            // the idle TTL trips. Evict now; the next requester for
            // this key starts a fresh handle.
            self.shared.socket_pool.evict(&key);
            return Err(RunnerError::Socket(format!(
                "connection for {} closed; handle evicted",
                key
            )));
        }

        let filter = def.filter.clone();
        let matches = move |msg: &serde_json::Value| match &filter {
            Some(f) => jsonpath::try_extract(msg, &f.path) == Some(&f.equals),
            None => true,
        };

        let message = match def.max_age_secs {
            Some(age) => match handle.latest(&matches, Some(Duration::from_secs(age))) {
                Some(buffered) => buffered,
                None => {
                    handle
                        .await_next(&matches, ctx.socket_wait(Duration::from_millis(def.max_wait_ms)))
                        .await?
                }
            },
            None => {
                handle
                    .await_next(&matches, ctx.socket_wait(Duration::from_millis(def.max_wait_ms)))
                    .await?
            }
        };

        let leaf = match &def.extract {
            Some(path) => jsonpath::extract(&message, path)?,
            None => &message,
        };
        ctx.set_result(RunningResult::from_json(leaf)?);
        Ok(())
    }

    async fn handle_fetch(
        &self,
        ctx: &mut ExecutionContext,
        def: &FetchDef,
    ) -> Result<(), RunnerError> {
        let cache_key = format!("{}:{}", def.client, def.params);

        if def.cache_ttl_secs.is_some() {
            if let Some(cached) = self.shared.fetch_cache.get(&cache_key) {
                debug!(client = %def.client, "fetch served from cache");
                ctx.set_result(cached);
                return Ok(());
            }
        }

        let fetcher = self.shared.fetchers.get(&def.client)?;
        let value = fetcher.fetch_value(&def.params).await?;

        if let Some(ttl) = def.cache_ttl_secs {
            self.shared
                .fetch_cache
                .insert(cache_key, value.clone(), Duration::from_secs(ttl));
        }

        ctx.set_result(value);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Structured recursion
    // ─────────────────────────────────────────────────────────────

    async fn handle_conditional(
        &self,
        ctx: &mut ExecutionContext,
        def: &ConditionalDef,
    ) -> Result<(), RunnerError> {
        if def.attempt.is_empty() {
            return Err(RunnerError::definition("conditional", "attempt list is empty"));
        }
        if def.on_failure.is_empty() {
            return Err(RunnerError::definition(
                "conditional",
                "onFailure list is empty",
            ));
        }

        match self.run_sub_tasks(ctx, &def.attempt).await {
            Ok(result) => {
                ctx.set_result(result);
                Ok(())
            }
            Err(attempt_error) => {
                warn!(error = %attempt_error, "attempt branch failed, running fallback");
                let result = self.run_sub_tasks(ctx, &def.on_failure).await?;
                ctx.set_result(result);
                Ok(())
            }
        }
    }

    async fn handle_cache(
        &self,
        ctx: &mut ExecutionContext,
        def: &CacheDef,
    ) -> Result<(), RunnerError> {
        if def.items.is_empty() {
            return Err(RunnerError::definition("cache", "item list is empty"));
        }
        for (i, item) in def.items.iter().enumerate() {
            if item.variable_name.is_empty() {
                return Err(RunnerError::definition("cache", "variableName is empty"));
            }
            if item.tasks.is_empty() {
                return Err(RunnerError::definition(
                    "cache",
                    format!("item '{}' has no tasks", item.variable_name),
                ));
            }
            if def.items[..i]
                .iter()
                .any(|prior| prior.variable_name == item.variable_name)
            {
                return Err(RunnerError::definition(
                    "cache",
                    format!("duplicate variableName '{}'", item.variable_name),
                ));
            }
        }

        // All items run concurrently on independent forks. join_all
        // lets every item settle before the first error surfaces, and
        // nothing is published unless the whole batch succeeded, so
        // later tasks never observe a partial assignment.
        let sub_jobs = def.items.iter().map(|item| {
            let fork = ctx.fork();
            async move {
                let result = self.run_fork(fork, &item.tasks).await?;
                Ok::<_, RunnerError>((item.variable_name.clone(), result))
            }
        });

        let mut batch = Vec::with_capacity(def.items.len());
        for settled in join_all(sub_jobs).await {
            batch.push(settled?);
        }
        ctx.publish_variables(batch);

        // The running result passes through unchanged; the cache task
        // only fills the variable side-table.
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Numeric handlers
    // ─────────────────────────────────────────────────────────────

    fn handle_round(&self, ctx: &mut ExecutionContext, def: &RoundDef) -> Result<(), RunnerError> {
        let value = ctx.require_result()?.as_decimal()?;
        ctx.set_result(RunningResult::Decimal(numeric::round(
            value,
            def.decimals,
            def.mode,
        )));
        Ok(())
    }

    fn handle_bound(&self, ctx: &mut ExecutionContext, def: &BoundDef) -> Result<(), RunnerError> {
        if def.lower.is_none() && def.upper.is_none() {
            return Err(RunnerError::definition("bound", "no bound given"));
        }
        let value = ctx.require_result()?.as_decimal()?;
        if let Some(lower) = def.lower {
            if value < lower {
                return Err(RunnerError::Numeric(format!(
                    "{} below lower bound {}",
                    value, lower
                )));
            }
        }
        if let Some(upper) = def.upper {
            if value > upper {
                return Err(RunnerError::Numeric(format!(
                    "{} above upper bound {}",
                    value, upper
                )));
            }
        }
        // In-range values pass through untouched.
        Ok(())
    }

    async fn handle_arithmetic(
        &self,
        ctx: &mut ExecutionContext,
        operand: &Operand,
        op: fn(Decimal, Decimal) -> Result<Decimal, RunnerError>,
    ) -> Result<(), RunnerError> {
        let lhs = ctx.require_result()?.as_decimal()?;
        let rhs = self.resolve_operand(ctx, operand).await?;
        ctx.set_result(RunningResult::Decimal(op(lhs, rhs)?));
        Ok(())
    }

    async fn resolve_operand(
        &self,
        ctx: &ExecutionContext,
        operand: &Operand,
    ) -> Result<Decimal, RunnerError> {
        match operand {
            Operand::Scalar(value) => Ok(*value),
            Operand::Variable { variable } => ctx.variable(variable)?.as_decimal(),
            Operand::Job { tasks } => self.run_sub_tasks(ctx, tasks).await?.as_decimal(),
        }
    }

    async fn handle_aggregate(
        &self,
        ctx: &mut ExecutionContext,
        def: &AggregateDef,
        aggregate: fn(&[Decimal]) -> Result<Decimal, RunnerError>,
    ) -> Result<(), RunnerError> {
        if def.values.is_empty() && def.jobs.is_empty() {
            return Err(RunnerError::definition("aggregate", "no inputs given"));
        }

        let mut samples = def.values.clone();
        // Aggregation sub-jobs run sequentially: concurrency in this
        // engine is confined to the cache task.
        for tasks in &def.jobs {
            samples.push(self.run_sub_tasks(ctx, tasks).await?.as_decimal()?);
        }
        ctx.set_result(RunningResult::Decimal(aggregate(&samples)?));
        Ok(())
    }

    async fn handle_ema(&self, ctx: &mut ExecutionContext, def: &EmaDef) -> Result<(), RunnerError> {
        if def.lambda <= Decimal::ZERO || def.lambda > Decimal::ONE {
            return Err(RunnerError::definition(
                "ema",
                format!("lambda {} outside (0, 1]", def.lambda),
            ));
        }

        let fetcher = self.shared.fetchers.get(&def.client)?;
        let history = fetcher.fetch_history(&def.params).await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RunnerError::Numeric(e.to_string()))?
            .as_secs() as i64;

        let value = numeric::ema(&history, def.lambda, def.period_secs, now)?;
        ctx.set_result(RunningResult::Decimal(value));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Extraction handlers
    // ─────────────────────────────────────────────────────────────

    fn handle_json_path(&self, ctx: &mut ExecutionContext, path: &str) -> Result<(), RunnerError> {
        let text = ctx.require_result()?.as_text();
        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        let leaf = jsonpath::extract(&parsed, path)?;
        ctx.set_result(RunningResult::from_json(leaf)?);
        Ok(())
    }

    fn handle_regex(
        &self,
        ctx: &mut ExecutionContext,
        pattern: &str,
        group: usize,
    ) -> Result<(), RunnerError> {
        let regex = regex::Regex::new(pattern)
            .map_err(|e| RunnerError::definition("regexExtract", e.to_string()))?;
        let text = ctx.require_result()?.as_text();

        let captures = regex
            .captures(&text)
            .ok_or_else(|| RunnerError::Regex(format!("pattern '{}' matched nothing", pattern)))?;
        let matched = captures
            .get(group)
            .ok_or_else(|| RunnerError::Regex(format!("no capture group {}", group)))?
            .as_str();

        ctx.set_result(match matched.trim().parse::<Decimal>() {
            Ok(d) => RunningResult::Decimal(d),
            Err(_) => RunningResult::Text(matched.to_string()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::fetcher::{FetcherRegistry, MockFetcher};
    use serde_json::json;
    use std::str::FromStr;

    fn runner() -> JobRunner {
        JobRunner::new(SharedState::new(FetcherRegistry::new(), SafetyConfig::default()))
    }

    fn runner_with(fetchers: FetcherRegistry) -> JobRunner {
        JobRunner::new(SharedState::new(fetchers, SafetyConfig::default()))
    }

    fn job(tasks: serde_json::Value) -> Job {
        serde_json::from_value(json!({ "tasks": tasks })).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn value_task_sets_the_running_result() {
        let result = runner()
            .execute(&job(json!([{"value": {"value": "1337.1337"}}])), None)
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("1337.1337")));
    }

    #[tokio::test]
    async fn empty_job_is_a_definition_error() {
        let err = runner().execute(&job(json!([])), None).await.unwrap_err();
        assert!(err.is_definition());
    }

    #[tokio::test]
    async fn arithmetic_chain() {
        let result = runner()
            .execute(
                &job(json!([
                    {"value": {"value": 10}},
                    {"add": 5},
                    {"multiply": 2},
                    {"divide": 7},
                    {"round": {"decimals": 4, "mode": "down"}}
                ])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("4.2857")));
    }

    #[tokio::test]
    async fn operand_from_sub_job() {
        let result = runner()
            .execute(
                &job(json!([
                    {"value": {"value": 8}},
                    {"subtract": {"tasks": [{"value": {"value": 3}}]}}
                ])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("5")));
    }

    #[tokio::test]
    async fn arithmetic_without_input_fails() {
        let err = runner()
            .execute(&job(json!([{"add": 1}])), None)
            .await
            .unwrap_err();
        match err {
            RunnerError::Task { task_type, source, .. } => {
                assert_eq!(task_type, "add");
                assert!(matches!(*source, RunnerError::MissingInput));
            }
            other => panic!("expected task wrapper, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn initial_input_feeds_the_first_task() {
        let result = runner()
            .execute(
                &job(json!([{"add": 1}])),
                Some(RunningResult::Decimal(dec("41"))),
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("42")));
    }

    #[tokio::test]
    async fn bound_passes_in_range_and_rejects_out_of_range() {
        let ok = runner()
            .execute(
                &job(json!([
                    {"value": {"value": 50}},
                    {"bound": {"lower": 10, "upper": 100}}
                ])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ok, RunningResult::Decimal(dec("50")));

        let err = runner()
            .execute(
                &job(json!([
                    {"value": {"value": 5}},
                    {"bound": {"lower": 10}}
                ])),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Task { .. }));
    }

    #[tokio::test]
    async fn aggregates_over_values_and_jobs() {
        let result = runner()
            .execute(
                &job(json!([
                    {"median": {
                        "values": [3],
                        "jobs": [
                            [{"value": {"value": 1}}],
                            [{"value": {"value": 2}}]
                        ]
                    }}
                ])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("2")));
    }

    #[tokio::test]
    async fn range_task_is_max_minus_min() {
        let result = runner()
            .execute(
                &job(json!([{"range": {"values": [3, 1, 2]}}])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("2")));
    }

    #[tokio::test]
    async fn empty_aggregate_is_a_definition_error() {
        let err = runner()
            .execute(&job(json!([{"mean": {}}])), None)
            .await
            .unwrap_err();
        assert!(err.is_definition());
    }

    #[tokio::test]
    async fn json_path_then_arithmetic() {
        let result = runner()
            .execute(
                &job(json!([{"jsonPath": {"path": "$.data.price"}}, {"multiply": 2}])),
                Some(RunningResult::Text(
                    r#"{"data": {"price": "21.5"}}"#.to_string(),
                )),
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("43")));
    }

    #[tokio::test]
    async fn regex_extract_captures_group() {
        let result = runner()
            .execute(
                &job(json!([{"regexExtract": {"pattern": r"price=(\d+\.\d+)", "group": 1}}])),
                Some(RunningResult::Text("price=12.34;volume=5".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("12.34")));
    }

    #[tokio::test]
    async fn fetch_task_uses_registered_client() {
        let fetchers = FetcherRegistry::new()
            .register(Arc::new(MockFetcher::returning("spot", dec("99.5"))));
        let result = runner_with(fetchers)
            .execute(
                &job(json!([{"fetch": {"client": "spot"}}])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("99.5")));
    }

    #[tokio::test]
    async fn fetch_task_unknown_client() {
        let err = runner()
            .execute(&job(json!([{"fetch": {"client": "nope"}}])), None)
            .await
            .unwrap_err();
        match err {
            RunnerError::Task { source, .. } => {
                assert!(matches!(*source, RunnerError::UnknownClient { .. }))
            }
            other => panic!("expected task wrapper, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_task_memoizes_when_ttl_given() {
        let mock = Arc::new(MockFetcher::returning("spot", dec("7")));
        let fetchers = FetcherRegistry::new().register(Arc::clone(&mock) as _);
        let runner = runner_with(fetchers);

        let j = job(json!([{"fetch": {"client": "spot", "cacheTtlSecs": 60}}]));
        runner.execute(&j, None).await.unwrap();
        runner.execute(&j, None).await.unwrap();
        assert_eq!(mock.call_count(), 1);

        // Without a TTL every execution fetches.
        let uncached = job(json!([{"fetch": {"client": "spot"}}]));
        runner.execute(&uncached, None).await.unwrap();
        runner.execute(&uncached, None).await.unwrap();
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn ema_task_pulls_history_from_client() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut history = vec![(now - 120, dec("5"))];
        history.push((now - 90, dec("10")));
        history.push((now - 30, dec("20")));

        let fetchers = FetcherRegistry::new().register(Arc::new(
            MockFetcher::returning("candles", dec("0")).with_history(history),
        ));
        let result = runner_with(fetchers)
            .execute(
                &job(json!([{"ema": {"client": "candles", "lambda": "0.5", "periodSecs": 60}}])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, RunningResult::Decimal(dec("15")));
    }

    #[tokio::test]
    async fn ema_lambda_out_of_domain_is_definition_error() {
        let fetchers = FetcherRegistry::new()
            .register(Arc::new(MockFetcher::returning("candles", dec("0"))));
        let err = runner_with(fetchers)
            .execute(
                &job(json!([{"ema": {"client": "candles", "lambda": "1.5", "periodSecs": 60}}])),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_definition());
    }
}
