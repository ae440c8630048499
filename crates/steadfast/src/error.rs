//! Error types shared across the resilience patterns
//!
//! `ResilienceError` is generic over the underlying operation error type `E`
//! so it can wrap and preserve the original failure while adding the
//! resilience-specific variants: rejections that never ran the task (circuit
//! open, bulkhead full), timeouts, and retry exhaustion.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type for heterogeneous error values.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result type for configuration construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by protected executions.
///
/// Variants fall into the four classes callers care about: domain failures
/// (`Operation`), exhaustion (`RetryExhausted`), rejections that never ran
/// the task (`CircuitOpen`, `BulkheadFull`), and timeouts. Saga failures
/// carry their own [`crate::saga::SagaError`] because they embed the full
/// compensation outcome list.
//
// NOTE: `Error`/`Display` are implemented by hand rather than via
// `#[derive(Error)]`. The `RetryExhausted` variant carries a
// `Box<ResilienceError<E>>` as its `#[source]`, which makes thiserror's
// generated `AsDynError` bound recurse infinitely for a generic `E`
// (overflow evaluating `Box<ResilienceError<E>>: Error`). The manual impls
// below reproduce the same `Display` messages and `source()` wiring without
// that recursion.
#[derive(Debug)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open; the task was never invoked.
    ///
    /// `retry_after` hints how long remains until the breaker will probe
    /// recovery again.
    CircuitOpen { retry_after: Option<Duration> },

    /// Bulkhead has no free permit; the task was never invoked.
    BulkheadFull { capacity: usize },

    /// The operation did not complete within the configured limit.
    Timeout { timeout: Duration },

    /// All retry attempts were consumed; `source` is the last failure.
    RetryExhausted {
        attempts: u32,
        source: Box<ResilienceError<E>>,
    },

    /// The underlying operation failed with a domain error.
    Operation { source: E },
}

impl<E> fmt::Display for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { .. } => {
                write!(f, "circuit breaker is open, rejecting calls")
            }
            Self::BulkheadFull { capacity } => {
                write!(f, "bulkhead capacity exceeded: {capacity} concurrent operations")
            }
            Self::Timeout { timeout } => {
                write!(f, "operation timed out after {timeout:?}")
            }
            Self::RetryExhausted { attempts, .. } => {
                write!(f, "all retry attempts exhausted after {attempts} tries")
            }
            Self::Operation { .. } => write!(f, "operation failed"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { source, .. } => Some(&**source),
            Self::Operation { source } => Some(source),
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::Timeout { .. } => None,
        }
    }
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether this error is a rejection raised without running the task.
    ///
    /// Rejections are never retried by default.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::BulkheadFull { .. })
    }

    /// The domain failure carried by this error, if any.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation { source } => Some(source),
            Self::RetryExhausted { source, .. } => source.operation_error(),
            _ => None,
        }
    }

    /// Consume the error, returning the domain failure if one is carried.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation { source } => Some(source),
            Self::RetryExhausted { source, .. } => source.into_operation_error(),
            _ => None,
        }
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_is_rejection() {
        assert!(ResilienceError::<Boom>::CircuitOpen { retry_after: None }.is_rejection());
        assert!(ResilienceError::<Boom>::BulkheadFull { capacity: 4 }.is_rejection());
        assert!(!ResilienceError::<Boom>::Timeout { timeout: Duration::from_secs(1) }
            .is_rejection());
        assert!(!ResilienceError::Operation { source: Boom }.is_rejection());
    }

    #[test]
    fn test_operation_error_through_exhaustion() {
        let err = ResilienceError::RetryExhausted {
            attempts: 3,
            source: Box::new(ResilienceError::Operation { source: Boom }),
        };
        assert!(err.operation_error().is_some());
        assert!(err.into_operation_error().is_some());
    }

    #[test]
    fn test_display() {
        let err = ResilienceError::<Boom>::BulkheadFull { capacity: 8 };
        assert!(err.to_string().contains("8 concurrent"));

        let err = ResilienceError::<Boom>::RetryExhausted {
            attempts: 5,
            source: Box::new(ResilienceError::Operation { source: Boom }),
        };
        assert!(err.to_string().contains("5 tries"));
    }
}
