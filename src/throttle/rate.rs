//! Per-class fixed-window rate limiting.
//!
//! Each [`ApiClass`] owns one window, created lazily on first use. A
//! caller that finds its window full is not rejected; it reserves a slot
//! in the next window and sleeps until that window opens. Reservations
//! are handed out under one lock in arrival order, so waiters are served
//! first-come first-served and no window ever admits more than its budget.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use super::config::{ApiClass, RateBudget};
use crate::telemetry;
use crate::{LoopError, Result};

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    opens_at: Instant,
    resets_at: Instant,
}

pub(crate) struct RateLimiter {
    budgets: HashMap<ApiClass, RateBudget>,
    windows: Mutex<HashMap<ApiClass, RateWindow>>,
}

impl RateLimiter {
    pub(crate) fn new(budgets: HashMap<ApiClass, RateBudget>) -> Self {
        Self {
            budgets,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn check_class(&self, class: &ApiClass) -> Result<&RateBudget> {
        self.budgets
            .get(class)
            .ok_or_else(|| LoopError::UnknownApiClass(class.to_string()))
    }

    /// Reserve one execution slot for `class`.
    ///
    /// Returns the instant the slot's window opens, or `None` when the
    /// caller may proceed immediately.
    pub(crate) fn reserve(&self, class: &ApiClass, now: Instant) -> Result<Option<Instant>> {
        let budget = *self.check_class(class)?;
        let mut windows = self.lock();
        let window = windows.entry(class.clone()).or_insert(RateWindow {
            count: 0,
            opens_at: now,
            resets_at: now + budget.window,
        });

        if now >= window.resets_at {
            *window = RateWindow {
                count: 0,
                opens_at: now,
                resets_at: now + budget.window,
            };
        }

        if window.count >= budget.requests {
            let opens_at = window.resets_at;
            *window = RateWindow {
                count: 0,
                opens_at,
                resets_at: opens_at + budget.window,
            };
        }

        window.count += 1;
        Ok((window.opens_at > now).then_some(window.opens_at))
    }

    /// Reserve a slot and wait for it. Returns how long the caller waited.
    pub(crate) async fn acquire(&self, class: &ApiClass) -> Result<Duration> {
        let now = Instant::now();
        let Some(opens_at) = self.reserve(class, now)? else {
            return Ok(Duration::ZERO);
        };

        let wait = opens_at - now;
        metrics::counter!(telemetry::RATE_LIMIT_WAITS_TOTAL, "api_class" => class.to_string())
            .increment(1);
        warn!(
            api_class = %class,
            wait_ms = wait.as_millis() as u64,
            "rate limit reached, waiting for next window"
        );
        tokio::time::sleep_until(opens_at).await;
        Ok(wait)
    }

    /// Executions admitted in the class's current window (0 if unused).
    pub(crate) fn used(&self, class: &ApiClass) -> u32 {
        self.lock().get(class).map_or(0, |w| w.count)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ApiClass, RateWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(HashMap::from([(
            ApiClass::LLM,
            RateBudget::new(requests, Duration::from_secs(window_secs)),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_budget_without_waiting() {
        let limiter = limiter(3, 60);
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.reserve(&ApiClass::LLM, now).unwrap(), None);
        }
        assert_eq!(limiter.used(&ApiClass::LLM), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_reservation_waits_for_window_reset() {
        let limiter = limiter(2, 60);
        let start = Instant::now();
        limiter.reserve(&ApiClass::LLM, start).unwrap();
        limiter.reserve(&ApiClass::LLM, start).unwrap();

        let later = start + Duration::from_secs(10);
        let opens = limiter.reserve(&ApiClass::LLM, later).unwrap();
        assert_eq!(opens, Some(start + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_fills_successive_windows_in_order() {
        let limiter = limiter(2, 60);
        let start = Instant::now();
        let opens: Vec<_> = (0..5)
            .map(|_| limiter.reserve(&ApiClass::LLM, start).unwrap())
            .collect();
        let next = start + Duration::from_secs(60);
        let after = start + Duration::from_secs(120);
        assert_eq!(opens, vec![None, None, Some(next), Some(next), Some(after)]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = limiter(1, 60);
        let start = Instant::now();
        limiter.reserve(&ApiClass::LLM, start).unwrap();
        let later = start + Duration::from_secs(61);
        assert_eq!(limiter.reserve(&ApiClass::LLM, later).unwrap(), None);
        assert_eq!(limiter.used(&ApiClass::LLM), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_class_fails_fast() {
        let limiter = limiter(1, 60);
        let err = limiter
            .reserve(&ApiClass::new("video"), Instant::now())
            .unwrap_err();
        assert!(matches!(err, LoopError::UnknownApiClass(ref c) if c == "video"));
        assert_eq!(limiter.used(&ApiClass::new("video")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_until_next_window() {
        let limiter = limiter(1, 30);
        assert_eq!(limiter.acquire(&ApiClass::LLM).await.unwrap(), Duration::ZERO);

        let before = Instant::now();
        let waited = limiter.acquire(&ApiClass::LLM).await.unwrap();
        assert_eq!(waited, Duration::from_secs(30));
        assert_eq!(Instant::now() - before, Duration::from_secs(30));
    }
}
