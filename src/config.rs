//! Environment-level safety configuration
//!
//! Consumed by the URL safety gate and the HTTP fetch path. Parsing
//! is lenient: an unreadable value falls back to the default rather
//! than aborting, but the timeout composition below is a security
//! control and its exact shape must be preserved.

use std::time::Duration;

/// Hard ceiling applied to any explicitly configured response timeout.
pub const RESPONSE_TIMEOUT_CEILING_MS: u64 = 5_000;

/// Timeout used when no value is configured (or parsing fails).
/// Deliberately above the configured-value ceiling; see DESIGN.md.
pub const RESPONSE_TIMEOUT_DEFAULT_MS: u64 = 7_500;

/// Env var: set truthy to permit localhost/private network targets.
pub const ENV_ALLOW_LOCAL_TARGETS: &str = "FEEDLINE_ALLOW_LOCAL_TARGETS";
/// Env var: response size cap in bytes; unset means unlimited.
pub const ENV_HTTP_MAX_BYTES: &str = "FEEDLINE_HTTP_MAX_BYTES";
/// Env var: response timeout in milliseconds, capped at the ceiling.
pub const ENV_HTTP_TIMEOUT_MS: &str = "FEEDLINE_HTTP_TIMEOUT_MS";

/// Safety knobs for outbound fetches.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Permit localhost/loopback/private-range targets. The fixed
    /// hostname blocklist applies regardless.
    pub allow_local_targets: bool,

    /// Maximum response body size; `None` is unlimited.
    pub max_response_bytes: Option<u64>,

    /// Effective response timeout after bound/fallback composition.
    pub response_timeout: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allow_local_targets: false,
            max_response_bytes: None,
            response_timeout: Duration::from_millis(RESPONSE_TIMEOUT_DEFAULT_MS),
        }
    }
}

impl SafetyConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let allow_local_targets = std::env::var(ENV_ALLOW_LOCAL_TARGETS)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let max_response_bytes = std::env::var(ENV_HTTP_MAX_BYTES)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok());

        let response_timeout = compose_timeout(
            std::env::var(ENV_HTTP_TIMEOUT_MS)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok()),
        );

        Self {
            allow_local_targets,
            max_response_bytes,
            response_timeout,
        }
    }

    /// Builder-style override, mostly for tests.
    pub fn with_allow_local_targets(mut self, allow: bool) -> Self {
        self.allow_local_targets = allow;
        self
    }

    pub fn with_max_response_bytes(mut self, cap: Option<u64>) -> Self {
        self.max_response_bytes = cap;
        self
    }

    pub fn with_timeout_ms(mut self, configured: Option<u64>) -> Self {
        self.response_timeout = compose_timeout(configured);
        self
    }
}

/// `min(configured, ceiling)` when configured, default otherwise.
/// An explicit value is capped lower than the unconfigured default;
/// the asymmetry is preserved as specified.
fn compose_timeout(configured_ms: Option<u64>) -> Duration {
    let ms = match configured_ms {
        Some(ms) => ms.min(RESPONSE_TIMEOUT_CEILING_MS),
        None => RESPONSE_TIMEOUT_DEFAULT_MS,
    };
    Duration::from_millis(ms)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
