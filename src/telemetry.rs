//! Telemetry metric name constants.
//!
//! Centralised metric names for loopcal operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `loopcal_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `api_class`: rate budget the call ran under (e.g. "llm", "calendar")
//! - `status`: outcome: "ok" or "error"

/// Throttled calls answered from the result cache.
///
/// Labels: `api_class`.
pub const CACHE_HITS_TOTAL: &str = "loopcal_cache_hits_total";

/// Throttled calls that missed the result cache.
///
/// Labels: `api_class`.
pub const CACHE_MISSES_TOTAL: &str = "loopcal_cache_misses_total";

/// Calls that attached to an identical in-flight execution.
///
/// Labels: `api_class`.
pub const DEDUP_JOINS_TOTAL: &str = "loopcal_dedup_joins_total";

/// Executions that had to wait for the next rate window.
///
/// Labels: `api_class`.
pub const RATE_LIMIT_WAITS_TOTAL: &str = "loopcal_rate_limit_waits_total";

/// Wrapped operations actually executed.
///
/// Labels: `api_class`, `status` ("ok" | "error").
pub const EXECUTIONS_TOTAL: &str = "loopcal_executions_total";

/// Wrapped operation duration in seconds, excluding rate-limit waits.
///
/// Labels: `api_class`.
pub const EXECUTION_DURATION_SECONDS: &str = "loopcal_execution_duration_seconds";

/// Calendar provider HTTP requests.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const CALENDAR_REQUESTS_TOTAL: &str = "loopcal_calendar_requests_total";
