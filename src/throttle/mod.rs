//! Request throttling: in-flight deduplication, per-class rate limiting
//! and a TTL result cache in front of paid external APIs.
//!
//! # Flow
//!
//! Every call to [`RequestThrottler::throttle()`] runs the same sequence:
//!
//! 1. **Cache.** A live entry for the key is returned immediately, with no
//!    rate-limit charge and no operation call. An expired entry is removed
//!    and treated as a miss.
//! 2. **In-flight.** If an execution for the key is already running, the
//!    caller attaches to it and receives the same result (or the same
//!    failure) as every other attached caller.
//! 3. **Rate limit.** Otherwise the caller registers a new execution. The
//!    execution first reserves a slot in its class's rate window, sleeping
//!    until the next window if the current one is full.
//! 4. **Execute.** The operation runs; on settle the in-flight entry is
//!    removed whatever the outcome, so a failed key is retryable at once.
//! 5. **Store.** A successful result is cached when the TTL is non-zero.
//!
//! Registration in step 3 happens synchronously under the in-flight lock,
//! before anything awaits, so at most one execution per key is ever live.
//!
//! # Executions outlive their callers
//!
//! Each execution is spawned onto the tokio runtime and shared between
//! callers via [`Shared`]. Dropping every awaiting caller does not cancel
//! it: the operation runs to completion, caches its result and clears its
//! in-flight entry. Bound runaway operations with
//! [`ThrottleConfig::operation_timeout()`].
//!
//! # Typed results over a type-erased store
//!
//! Results are stored as `Arc<dyn Any + Send + Sync>` and cloned out as
//! the caller's `T`. Two call sites that use one key for different types
//! get [`LoopError::TypeMismatch`] rather than a panic.

pub mod config;
pub mod key;
mod rate;

pub use config::{ApiClass, RateBudget, ThrottleConfig};
pub use key::request_key;

use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::rate::RateLimiter;
use crate::error::OperationFailure;
use crate::telemetry;
use crate::{LoopError, Result};

type SharedValue = Arc<dyn Any + Send + Sync>;
type Execution = Shared<BoxFuture<'static, Result<SharedValue>>>;

struct CacheEntry {
    value: SharedValue,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

/// Snapshot of the result cache, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of live (non-expired) entries.
    pub size: usize,
    /// Keys of the live entries, sorted.
    pub keys: Vec<String>,
}

struct Inner {
    limiter: RateLimiter,
    default_ttl: Duration,
    operation_timeout: Option<Duration>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Execution>>,
}

impl Inner {
    fn cache(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, Execution>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live cache lookup; drops the entry if it has expired.
    fn cached(&self, key: &str) -> Option<SharedValue> {
        let mut cache = self.cache();
        let entry = cache.get(key)?;
        if entry.is_expired(Instant::now()) {
            cache.remove(key);
            return None;
        }
        Some(Arc::clone(&entry.value))
    }

    fn store(&self, key: &str, value: SharedValue, ttl: Duration) {
        self.cache().insert(
            key.to_owned(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

/// Removes an execution's in-flight entry when the execution ends,
/// including when the operation panics.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.key);
    }
}

/// Deduplicating, rate-limiting, caching front for external API calls.
///
/// Cloning is cheap and every clone shares the same cache, in-flight
/// registry and rate windows. Construct one per process and hand clones
/// to request handlers; tests construct isolated instances.
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use loopcal::{ApiClass, RequestThrottler, ThrottleConfig};
/// # #[derive(Debug, thiserror::Error)]
/// # #[error("model unavailable")]
/// # struct ModelError;
/// # async fn generate_persona() -> Result<String, ModelError> { Ok("night owl".into()) }
/// # async fn run() -> loopcal::Result<()> {
/// let throttler = RequestThrottler::new(ThrottleConfig::default())?;
/// let persona: String = throttler
///     .throttle(
///         "persona_user1_hashABC",
///         &ApiClass::LLM,
///         Duration::from_secs(30 * 60),
///         generate_persona,
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestThrottler {
    inner: Arc<Inner>,
}

impl RequestThrottler {
    /// Create a throttler from a validated configuration.
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                limiter: RateLimiter::new(config.budgets),
                default_ttl: config.default_ttl,
                operation_timeout: config.operation_timeout,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Run `operation` under `key`, charged against `class`, caching a
    /// successful result for `ttl` (`Duration::ZERO` disables caching).
    ///
    /// Concurrent calls with the same key share one execution. A failure
    /// is returned to every caller sharing the execution as
    /// [`LoopError::Operation`] and is never cached.
    ///
    /// `ttl` only decides what this call stores. The cache lookup comes
    /// first, so a zero-TTL call is still served a live entry that an
    /// earlier call under the same key stored with a non-zero TTL.
    ///
    /// # Errors
    ///
    /// - [`LoopError::UnknownApiClass`] if `class` has no budget; checked
    ///   before the cache.
    /// - [`LoopError::Operation`] if the operation failed.
    /// - [`LoopError::Timeout`] if an operation timeout is configured and
    ///   was exceeded.
    /// - [`LoopError::TypeMismatch`] if the key holds a different type.
    pub async fn throttle<T, F, Fut, E>(
        &self,
        key: &str,
        class: &ApiClass,
        ttl: Duration,
        operation: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.inner.limiter.check_class(class)?;

        if let Some(value) = self.inner.cached(key) {
            return self.cache_hit(key, class, value);
        }

        let (execution, joined) = {
            let mut in_flight = self.inner.in_flight();
            if let Some(existing) = in_flight.get(key) {
                (existing.clone(), true)
            } else if let Some(value) = self.inner.cached(key) {
                // Settled between the first lookup and taking the lock.
                drop(in_flight);
                return self.cache_hit(key, class, value);
            } else {
                let execution = self.spawn_execution(key, class, ttl, operation);
                in_flight.insert(key.to_owned(), execution.clone());
                (execution, false)
            }
        };

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "api_class" => class.to_string())
            .increment(1);
        if joined {
            metrics::counter!(telemetry::DEDUP_JOINS_TOTAL, "api_class" => class.to_string())
                .increment(1);
            debug!(key, api_class = %class, "request already in flight, waiting");
        }

        let value = execution.await?;
        downcast(key, &value)
    }

    /// [`throttle()`](Self::throttle) with the configured default TTL.
    pub async fn throttle_default_ttl<T, F, Fut, E>(
        &self,
        key: &str,
        class: &ApiClass,
        operation: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.throttle(key, class, self.inner.default_ttl, operation)
            .await
    }

    /// Live cache entries. Expired entries are excluded but not removed.
    pub fn cache_stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .cache()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        CacheStats {
            size: keys.len(),
            keys,
        }
    }

    /// Drop every cached result. In-flight executions and rate windows
    /// are untouched.
    pub fn clear_cache(&self) {
        self.inner.cache().clear();
    }

    /// Drop the cached result for one key. Returns whether one existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.cache().remove(key).is_some()
    }

    /// Number of executions currently running or waiting on a rate window.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight().len()
    }

    /// Whether an execution for `key` is currently running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight().contains_key(key)
    }

    /// Executions admitted in `class`'s current rate window.
    pub fn window_usage(&self, class: &ApiClass) -> u32 {
        self.inner.limiter.used(class)
    }

    fn cache_hit<T: Clone + 'static>(
        &self,
        key: &str,
        class: &ApiClass,
        value: SharedValue,
    ) -> Result<T> {
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "api_class" => class.to_string())
            .increment(1);
        debug!(key, api_class = %class, "cache hit");
        downcast(key, &value)
    }

    fn spawn_execution<T, F, Fut, E>(
        &self,
        key: &str,
        class: &ApiClass,
        ttl: Duration,
        operation: F,
    ) -> Execution
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
        };
        let handle = tokio::spawn(run_execution(guard, class.clone(), ttl, operation));

        async move {
            match handle.await {
                Ok(settled) => settled,
                Err(join_err) => Err(LoopError::Operation(OperationFailure::new(join_err))),
            }
        }
        .boxed()
        .shared()
    }
}

/// Body of a spawned execution: rate window, operation, cache store.
///
/// The guard lives for the whole body, so the in-flight entry is removed
/// only after the result has been cached.
async fn run_execution<T, F, Fut, E>(
    guard: InFlightGuard,
    class: ApiClass,
    ttl: Duration,
    operation: F,
) -> Result<SharedValue>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: StdError + Send + Sync + 'static,
{
    let inner = &guard.inner;
    let key = guard.key.as_str();

    inner.limiter.acquire(&class).await?;

    info!(key, api_class = %class, "executing request");
    let started = Instant::now();
    let outcome = match inner.operation_timeout {
        Some(limit) => match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result.map_err(|e| LoopError::Operation(OperationFailure::new(e))),
            Err(_) => Err(LoopError::Timeout {
                key: key.to_owned(),
                after: limit,
            }),
        },
        None => operation()
            .await
            .map_err(|e| LoopError::Operation(OperationFailure::new(e))),
    };
    metrics::histogram!(telemetry::EXECUTION_DURATION_SECONDS, "api_class" => class.to_string())
        .record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(value) => {
            let value: SharedValue = Arc::new(value);
            if !ttl.is_zero() {
                inner.store(key, Arc::clone(&value), ttl);
            }
            metrics::counter!(telemetry::EXECUTIONS_TOTAL,
                "api_class" => class.to_string(),
                "status" => "ok",
            )
            .increment(1);
            Ok(value)
        }
        Err(e) => {
            metrics::counter!(telemetry::EXECUTIONS_TOTAL,
                "api_class" => class.to_string(),
                "status" => "error",
            )
            .increment(1);
            warn!(key, api_class = %class, error = %e, "request failed");
            Err(e)
        }
    }
}

fn downcast<T: Clone + 'static>(key: &str, value: &SharedValue) -> Result<T> {
    (**value)
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| LoopError::TypeMismatch {
            key: key.to_owned(),
        })
}
