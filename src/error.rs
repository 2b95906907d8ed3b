//! Error taxonomy for the task-runner engine
//!
//! One enum covers every failure class the engine can surface:
//! definition errors (bad job documents), wrapped task failures,
//! safety/SSRF violations, stale shared resources, and aggregation
//! functions that ran out of history. The engine never retries:
//! every error aborts the current job (or triggers a conditional
//! fallback) and is returned to the caller with enough context to
//! reproduce the failure.

use thiserror::Error;

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum RunnerError {
    // ─────────────────────────────────────────────────────────────
    // Definition errors: malformed job documents, always fatal,
    // never retried, surfaced with the offending task type.
    // ─────────────────────────────────────────────────────────────
    #[error("Definition error in {task_type}: {reason}")]
    Definition { task_type: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Task wrapper: every handler failure is wrapped with the task
    // type and a serialized snapshot of its input parameters so
    // callers can log/alert with a consistent shape.
    // ─────────────────────────────────────────────────────────────
    #[error("Task {task_type} failed (params: {params}): {source}")]
    Task {
        task_type: String,
        params: String,
        #[source]
        source: Box<RunnerError>,
    },

    // ─────────────────────────────────────────────────────────────
    // Safety: SSRF/policy violations, fatal regardless of overrides.
    // ─────────────────────────────────────────────────────────────
    #[error("Hostname disabled: {host} ({reason})")]
    HostnameDisabled { host: String, reason: String },

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Response exceeded size limit of {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    // ─────────────────────────────────────────────────────────────
    // Shared-resource staleness: the resource is evicted and the
    // task fails; the job is not retried by this layer.
    // ─────────────────────────────────────────────────────────────
    #[error("Socket for {key} is stale (idle past TTL)")]
    StaleSocket { key: String },

    #[error("No websocket message matched within {waited_ms}ms")]
    SocketTimeout { waited_ms: u64 },

    #[error("Socket error: {0}")]
    Socket(String),

    // ─────────────────────────────────────────────────────────────
    // Aggregation: insufficient history is an error, never an
    // approximation.
    // ─────────────────────────────────────────────────────────────
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    // ─────────────────────────────────────────────────────────────
    // Leaf failures raised inside handlers.
    // ─────────────────────────────────────────────────────────────
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Fetch client error: {0}")]
    Fetch(String),

    #[error("Unknown fetch client '{name}'")]
    UnknownClient { name: String },

    #[error("Unknown variable '${{{name}}}' (no cache task wrote it)")]
    UnknownVariable { name: String },

    #[error("Task requires a running result but none was produced yet")]
    MissingInput,

    #[error("Expected a decimal running result, got text '{0}'")]
    NotADecimal(String),

    #[error("Regex error: {0}")]
    Regex(String),

    #[error("Path '{path}' {reason}")]
    Path { path: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Wrap a handler failure with its task type and a serialized
    /// snapshot of the task's input parameters.
    pub fn task<P: serde::Serialize>(task_type: &str, params: &P, source: RunnerError) -> Self {
        let params =
            serde_json::to_string(params).unwrap_or_else(|_| "<unserializable>".to_string());
        RunnerError::Task {
            task_type: task_type.to_string(),
            params,
            source: Box::new(source),
        }
    }

    /// Definition errors are never retryable and never wrapped further.
    pub fn definition(task_type: &str, reason: impl Into<String>) -> Self {
        RunnerError::Definition {
            task_type: task_type.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that indicate a malformed job document rather
    /// than a runtime fault.
    pub fn is_definition(&self) -> bool {
        match self {
            RunnerError::Definition { .. } => true,
            RunnerError::Task { source, .. } => source.is_definition(),
            _ => false,
        }
    }
}
