//! Job and task definitions
//!
//! A job is an ordered, non-empty list of tasks. Each task carries
//! exactly one action keyword with a nested definition block; the
//! untagged enum rejects documents with zero or multiple populated
//! payloads at deserialization time, so past construction dispatch
//! is an exhaustive match.
//!
//! ```json
//! {
//!   "tasks": [
//!     { "http": { "url": "https://api.example.com/price" } },
//!     { "jsonPath": { "path": "$.result.price" } },
//!     { "round": { "decimals": 2, "mode": "down" } }
//!   ]
//! }
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RunnerError;

// ============================================================================
// RUNNING RESULT
// ============================================================================

/// The value threaded from task to task within one execution scope.
///
/// Feed values are arbitrary-precision decimals, never floats; text
/// carries intermediate payloads (HTTP bodies, extracted fields).
/// Decimal→Text→Decimal round trips are lossless: `Decimal` display
/// is exact and carries no ambient rounding state that could leak
/// between concurrent conversions.
#[derive(Debug, Clone, PartialEq)]
pub enum RunningResult {
    Decimal(Decimal),
    Text(String),
}

impl RunningResult {
    /// Coerce to a decimal, parsing text if necessary.
    pub fn as_decimal(&self) -> Result<Decimal, RunnerError> {
        match self {
            RunningResult::Decimal(d) => Ok(*d),
            RunningResult::Text(s) => {
                Decimal::from_str(s.trim()).map_err(|_| RunnerError::NotADecimal(s.clone()))
            }
        }
    }

    /// Text rendering; exact for decimals.
    pub fn as_text(&self) -> String {
        match self {
            RunningResult::Decimal(d) => d.to_string(),
            RunningResult::Text(s) => s.clone(),
        }
    }

    /// Build a result from a JSON leaf: numbers and numeric strings
    /// become decimals, everything else is carried as text.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, RunnerError> {
        match value {
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                .map(RunningResult::Decimal)
                .map_err(|e| RunnerError::Numeric(e.to_string())),
            serde_json::Value::String(s) => Ok(match Decimal::from_str(s.trim()) {
                Ok(d) => RunningResult::Decimal(d),
                Err(_) => RunningResult::Text(s.clone()),
            }),
            other => Ok(RunningResult::Text(other.to_string())),
        }
    }
}

impl fmt::Display for RunningResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningResult::Decimal(d) => write!(f, "{}", d),
            RunningResult::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<Decimal> for RunningResult {
    fn from(d: Decimal) -> Self {
        RunningResult::Decimal(d)
    }
}

// ============================================================================
// JOB
// ============================================================================

/// The ordered list of tasks submitted for execution. Immutable once
/// submitted; an empty task list is a definition error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub tasks: Vec<Task>,
}

impl Job {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

// ============================================================================
// TASK: ONE ACTION KEYWORD PER NODE
// ============================================================================

/// One typed operation within a job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Task {
    /// value: set the running result to a literal decimal
    Value { value: ValueDef },

    /// http: fetch a URL body (SafeFetcher-gated)
    Http { http: HttpDef },

    /// websocket: read from a shared streaming connection
    Websocket { websocket: WebsocketDef },

    /// fetch: pluggable protocol client lookup
    Fetch { fetch: FetchDef },

    /// cache: run named sub-jobs concurrently, store results as variables
    Cache { cache: CacheDef },

    /// conditional: attempt branch with a fallback on failure
    Conditional { conditional: ConditionalDef },

    /// round: round the running result to N decimal places
    Round { round: RoundDef },

    /// bound: fail when the running result leaves [lower, upper]
    Bound { bound: BoundDef },

    /// add: running result + operand
    Add { add: Operand },

    /// subtract: running result − operand
    Subtract { subtract: Operand },

    /// multiply: running result × operand
    Multiply { multiply: Operand },

    /// divide: running result ÷ operand
    Divide { divide: Operand },

    /// pow: running result raised to the operand
    Pow { pow: Operand },

    /// max over sub-job results and literal values
    Max { max: AggregateDef },

    /// min over sub-job results and literal values
    Min { min: AggregateDef },

    /// mean over sub-job results and literal values
    Mean { mean: AggregateDef },

    /// median over sub-job results and literal values
    Median { median: AggregateDef },

    /// range: max − min over sub-job results and literal values
    Range { range: AggregateDef },

    /// ema: exponential moving average over fetched history
    Ema { ema: EmaDef },

    /// jsonPath: extract a field from a JSON running result
    JsonPath {
        #[serde(rename = "jsonPath")]
        json_path: JsonPathDef,
    },

    /// regexExtract: capture a group from a text running result
    RegexExtract {
        #[serde(rename = "regexExtract")]
        regex_extract: RegexExtractDef,
    },
}

impl Task {
    /// Stable kind label used in error wrapping and tracing spans.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Value { .. } => "value",
            Task::Http { .. } => "http",
            Task::Websocket { .. } => "websocket",
            Task::Fetch { .. } => "fetch",
            Task::Cache { .. } => "cache",
            Task::Conditional { .. } => "conditional",
            Task::Round { .. } => "round",
            Task::Bound { .. } => "bound",
            Task::Add { .. } => "add",
            Task::Subtract { .. } => "subtract",
            Task::Multiply { .. } => "multiply",
            Task::Divide { .. } => "divide",
            Task::Pow { .. } => "pow",
            Task::Max { .. } => "max",
            Task::Min { .. } => "min",
            Task::Mean { .. } => "mean",
            Task::Median { .. } => "median",
            Task::Range { .. } => "range",
            Task::Ema { .. } => "ema",
            Task::JsonPath { .. } => "jsonPath",
            Task::RegexExtract { .. } => "regexExtract",
        }
    }
}

// ============================================================================
// DEFINITION BLOCKS
// ============================================================================

/// Literal value definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValueDef {
    pub value: Decimal,
}

/// HTTP fetch definition. GET only; the response body becomes the
/// running result as text.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpDef {
    pub url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Websocket read definition. Connections are shared process-wide by
/// (url, subscription); see the socket pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketDef {
    pub url: String,

    /// Subscription payload sent on connect; also part of the pool key.
    pub subscription: serde_json::Value,

    /// Only messages matching this filter are considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MessageFilter>,

    /// Path into the matched message that yields the result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,

    /// How long to wait for a matching message before failing.
    #[serde(default = "default_wait_ms")]
    pub max_wait_ms: u64,

    /// Accept a buffered message no older than this instead of waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

fn default_wait_ms() -> u64 {
    5_000
}

/// Matches a message when the value at `path` equals `equals`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageFilter {
    pub path: String,
    pub equals: serde_json::Value,
}

/// Pluggable client lookup definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchDef {
    /// Registered client name.
    pub client: String,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Memoize the fetched value for this long in the shared TTL cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

/// Named concurrent sub-jobs whose results land in the variable cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheDef {
    pub items: Vec<CacheItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem {
    pub variable_name: String,
    pub tasks: Vec<Task>,
}

/// Attempt/fallback definition. Both branches are required and
/// non-empty; the fallback runs only after the attempt fails.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalDef {
    pub attempt: Vec<Task>,
    pub on_failure: Vec<Task>,
}

/// Rounding definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoundDef {
    pub decimals: u32,
    pub mode: RoundMode,
}

/// Explicit rounding direction; no ambient default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundMode {
    /// Away from zero at the target precision.
    Up,
    /// Toward zero at the target precision.
    Down,
}

/// Sanity bound definition; at least one of lower/upper is required.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoundDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<Decimal>,
}

/// Right-hand side of an arithmetic task: a literal scalar, a named
/// variable written by an earlier cache task, or a nested sub-job
/// whose final result is used.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Operand {
    Scalar(Decimal),
    Variable { variable: String },
    Job { tasks: Vec<Task> },
}

/// Aggregation inputs: literal values and/or sub-jobs, combined into
/// one sample set. The combined set must be non-empty.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregateDef {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Decimal>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Vec<Task>>,
}

/// EMA definition; history is pulled from a registered client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmaDef {
    pub client: String,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Blend weight in (0, 1].
    pub lambda: Decimal,

    /// Window length in seconds.
    pub period_secs: u64,
}

/// JSON extraction definition ($.a.b[0] paths).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonPathDef {
    pub path: String,
}

/// Regex capture definition; group 0 is the whole match.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegexExtractDef {
    pub pattern: String,

    #[serde(default)]
    pub group: usize,
}
