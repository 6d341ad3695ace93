//! loopcal error types

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A wrapped operation's failure, shared by every caller that awaited it.
///
/// Deduplicated callers all receive a clone of the same value, so the
/// underlying error is kept behind an `Arc`. Use [`downcast_ref()`](Self::downcast_ref)
/// to recover the concrete error type the operation returned.
#[derive(Clone)]
pub struct OperationFailure(Arc<dyn StdError + Send + Sync>);

impl OperationFailure {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    /// Borrow the original error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Whether two failures are the same shared value (not merely equal).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The shared inner error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for OperationFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// loopcal error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoopError {
    // Throttler errors
    /// The caller named an API class with no configured budget.
    #[error("unknown API class: {0}")]
    UnknownApiClass(String),

    #[error("operation failed: {0}")]
    Operation(#[source] OperationFailure),

    #[error("operation for '{key}' timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    /// A value stored under `key` has a different type than requested.
    #[error("cached value for '{key}' has a different type")]
    TypeMismatch { key: String },

    // Provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("calendar access token expired or invalid")]
    AuthenticationFailed,

    #[error("calendar access denied")]
    AccessDenied,

    // Data errors
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("empty response from model")]
    EmptyResponse,
}

impl LoopError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LoopError::Http(_) | LoopError::Timeout { .. } => true,
            LoopError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Unwrap an [`Operation`](Self::Operation) failure whose operation
    /// itself returned a `LoopError`, so callers can match on the real
    /// cause. Anything else is returned unchanged.
    pub fn flatten(self) -> LoopError {
        let cause = match &self {
            LoopError::Operation(failure) => failure.downcast_ref::<LoopError>().cloned(),
            _ => None,
        };
        cause.map_or(self, LoopError::flatten)
    }
}

impl From<serde_json::Error> for LoopError {
    fn from(err: serde_json::Error) -> Self {
        LoopError::Json(Arc::new(err))
    }
}

impl From<reqwest::Error> for LoopError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return LoopError::InvalidInput(err.to_string());
        }
        LoopError::Http(err.to_string())
    }
}

/// Result type alias for loopcal operations
pub type Result<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct Boom(u32);

    #[test]
    fn operation_failure_downcasts_to_original() {
        let failure = OperationFailure::new(Boom(7));
        assert_eq!(failure.downcast_ref::<Boom>().map(|b| b.0), Some(7));
        assert_eq!(failure.to_string(), "boom: 7");
    }

    #[test]
    fn cloned_failures_share_the_same_value() {
        let a = OperationFailure::new(Boom(1));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&OperationFailure::new(Boom(1))));
    }

    #[test]
    fn flatten_recovers_wrapped_loop_errors() {
        let wrapped = LoopError::Operation(OperationFailure::new(LoopError::AccessDenied));
        assert!(matches!(wrapped.flatten(), LoopError::AccessDenied));

        let foreign = LoopError::Operation(OperationFailure::new(Boom(3)));
        assert!(matches!(foreign.flatten(), LoopError::Operation(_)));

        assert!(matches!(LoopError::EmptyResponse.flatten(), LoopError::EmptyResponse));
    }

    #[test]
    fn transient_classification() {
        assert!(LoopError::Http("reset".into()).is_transient());
        assert!(
            LoopError::Api {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            LoopError::Api {
                status: 429,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !LoopError::Api {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!LoopError::AuthenticationFailed.is_transient());
        assert!(!LoopError::UnknownApiClass("x".into()).is_transient());
    }

    #[test]
    fn operation_error_exposes_source() {
        let err = LoopError::Operation(OperationFailure::new(Boom(3)));
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.to_string(), "operation failed: boom: 3");
    }
}
