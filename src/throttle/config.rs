//! Throttler configuration: API classes, rate budgets and TTL defaults.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{LoopError, Result};

/// Category of external API a throttled call is charged against.
///
/// The three built-in classes cover the application's paid APIs; other
/// classes become valid once a [`RateBudget`] is configured for them.
///
/// ```rust
/// # use loopcal::ApiClass;
/// assert_eq!(ApiClass::LLM.as_str(), "llm");
/// assert_eq!(ApiClass::new("speech").as_str(), "speech");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiClass(Cow<'static, str>);

impl ApiClass {
    /// Text completion (persona, digest, suggestions, insights).
    pub const LLM: ApiClass = ApiClass(Cow::Borrowed("llm"));
    /// Calendar provider reads and writes.
    pub const CALENDAR: ApiClass = ApiClass(Cow::Borrowed("calendar"));
    /// Calls between the application's own endpoints.
    pub const INTERNAL: ApiClass = ApiClass(Cow::Borrowed("internal"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApiClass {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Fixed-window request budget for one [`ApiClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// Executions admitted per window.
    pub requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateBudget {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    /// `requests` per 60-second window.
    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }
}

/// Configuration for [`RequestThrottler`](super::RequestThrottler).
///
/// Defaults: `llm` 20/min, `calendar` 100/min, `internal` 200/min, a
/// 5-minute default TTL and no operation timeout.
///
/// ```rust
/// # use loopcal::{ApiClass, RateBudget, ThrottleConfig};
/// # use std::time::Duration;
/// let config = ThrottleConfig::new()
///     .budget(ApiClass::new("speech"), RateBudget::per_minute(10))
///     .default_ttl(Duration::from_secs(1800))
///     .operation_timeout(Duration::from_secs(90));
/// assert!(config.budget_for(&ApiClass::new("speech")).is_some());
/// ```
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Rate budget per API class. Classes missing here are rejected.
    pub budgets: HashMap<ApiClass, RateBudget>,
    /// TTL used by [`throttle_default_ttl()`](super::RequestThrottler::throttle_default_ttl).
    pub default_ttl: Duration,
    /// Upper bound on a single execution. `None` lets operations run
    /// indefinitely, and every duplicate waiter waits with them.
    pub operation_timeout: Option<Duration>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let budgets = HashMap::from([
            (ApiClass::LLM, RateBudget::per_minute(20)),
            (ApiClass::CALENDAR, RateBudget::per_minute(100)),
            (ApiClass::INTERNAL, RateBudget::per_minute(200)),
        ]);
        Self {
            budgets,
            default_ttl: Duration::from_secs(300),
            operation_timeout: None,
        }
    }
}

impl ThrottleConfig {
    /// Create a new config with the built-in budgets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the budget for an API class.
    pub fn budget(mut self, class: ApiClass, budget: RateBudget) -> Self {
        self.budgets.insert(class, budget);
        self
    }

    /// Set the TTL used when callers do not pass one.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Bound every execution by `timeout`.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn budget_for(&self, class: &ApiClass) -> Option<&RateBudget> {
        self.budgets.get(class)
    }

    /// Reject budgets that could never admit a request.
    pub fn validate(&self) -> Result<()> {
        for (class, budget) in &self.budgets {
            if budget.requests == 0 {
                return Err(LoopError::Configuration(format!(
                    "budget for '{class}' admits zero requests"
                )));
            }
            if budget.window.is_zero() {
                return Err(LoopError::Configuration(format!(
                    "budget for '{class}' has a zero-length window"
                )));
            }
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(LoopError::Configuration(
                "operation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_application_budgets() {
        let config = ThrottleConfig::default();
        assert_eq!(
            config.budget_for(&ApiClass::LLM),
            Some(&RateBudget::per_minute(20))
        );
        assert_eq!(
            config.budget_for(&ApiClass::CALENDAR),
            Some(&RateBudget::per_minute(100))
        );
        assert_eq!(
            config.budget_for(&ApiClass::INTERNAL),
            Some(&RateBudget::per_minute(200))
        );
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert!(config.operation_timeout.is_none());
    }

    #[test]
    fn owned_and_const_classes_are_equal() {
        assert_eq!(ApiClass::new("llm"), ApiClass::LLM);
        let config = ThrottleConfig::default();
        assert!(config.budget_for(&ApiClass::from("calendar")).is_some());
    }

    #[test]
    fn unknown_class_has_no_budget() {
        assert!(
            ThrottleConfig::default()
                .budget_for(&ApiClass::new("video"))
                .is_none()
        );
    }

    #[test]
    fn zero_request_budget_is_rejected() {
        let config = ThrottleConfig::new().budget(ApiClass::LLM, RateBudget::per_minute(0));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("zero requests"));
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = ThrottleConfig::new().budget(ApiClass::LLM, RateBudget::new(5, Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ThrottleConfig::new().operation_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_class_serializes_as_plain_string() {
        let json = serde_json::to_string(&ApiClass::CALENDAR).unwrap();
        assert_eq!(json, "\"calendar\"");
        let back: ApiClass = serde_json::from_str("\"speech\"").unwrap();
        assert_eq!(back, ApiClass::new("speech"));
    }
}
