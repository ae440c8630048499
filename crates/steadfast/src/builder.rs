//! Composition of resilience layers around a single task
//!
//! [`ResilienceBuilder`] chains Timeout, Bulkhead, Retry, and Circuit
//! Breaker with a fixed layering order, outermost to innermost:
//!
//! ```text
//! Timeout -> Bulkhead -> Retry -> Circuit Breaker -> task
//! ```
//!
//! The timeout bounds total wall-clock time across all retries. The
//! bulkhead admits the caller once, before any retry attempt consumes
//! capacity, and holds the permit for the whole sequence. Each retry
//! attempt is independently evaluated by the circuit breaker, so an
//! open-circuit rejection on one attempt is not itself retried: rejections
//! (circuit open, bulkhead full) are excluded from the retry predicate by
//! default, letting the breaker see and react to sustained failure.
//! [`execute_with_fallback`] wraps the entire composed chain, substituting
//! a value only after every inner layer has exhausted its own recovery.
//!
//! [`execute_with_fallback`]: ResilienceBuilder::execute_with_fallback

use std::future::Future;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, ResilienceResult};
use crate::retry::RetryPolicy;

/// Builder composing resilience layers around one task.
///
/// Layers are optional; configured layers always apply in the documented
/// order. The bulkhead and circuit breaker are shared instances: pass
/// clones of the per-resource objects so every call site sees the same
/// permit pool and breaker state.
#[derive(Debug, Clone, Default)]
pub struct ResilienceBuilder<C: Clock = SystemClock> {
    timeout: Option<Duration>,
    bulkhead: Option<Bulkhead>,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker<C>>,
}

impl ResilienceBuilder<SystemClock> {
    /// Builder with no layers configured.
    pub fn new() -> Self {
        Self { timeout: None, bulkhead: None, retry: None, breaker: None }
    }
}

impl<C: Clock> ResilienceBuilder<C> {
    /// Bound total wall-clock time, including every retry attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limit concurrent executions; admission happens before retrying.
    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Retry failed attempts under `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Gate every attempt through `breaker`.
    pub fn with_circuit_breaker<C2: Clock>(self, breaker: CircuitBreaker<C2>) -> ResilienceBuilder<C2> {
        ResilienceBuilder {
            timeout: self.timeout,
            bulkhead: self.bulkhead,
            retry: self.retry,
            breaker: Some(breaker),
        }
    }

    /// Execute `operation` through the configured layers.
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let guarded = async {
            // Bulkhead admission precedes retrying: one permit covers the
            // whole attempt sequence.
            let _permit = match &self.bulkhead {
                Some(bulkhead) => Some(bulkhead.admit().await?),
                None => None,
            };
            self.run_attempts(&mut operation).await
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout = ?limit, "composed call exceeded overall timeout");
                    Err(ResilienceError::Timeout { timeout: limit })
                }
            },
            None => guarded.await,
        }
    }

    /// Execute through the configured layers, substituting
    /// `fallback(error)` once every inner layer has given up.
    pub async fn execute_with_fallback<F, Fut, FB, FutB, T, E>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(ResilienceError<E>) -> FutB,
        FutB: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(error) => {
                debug!("composed chain failed, substituting fallback");
                fallback(error).await.map_err(|source| ResilienceError::Operation { source })
            }
        }
    }

    /// Retry loop over breaker-protected attempts.
    async fn run_attempts<F, Fut, T, E>(&self, operation: &mut F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(policy) = &self.retry else {
            return self.attempt(operation).await;
        };

        let mut attempt: u32 = 1;
        loop {
            match self.attempt(operation).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !Self::retryable(policy, &error) {
                        return Err(error);
                    }
                    if attempt >= policy.max_attempts {
                        return Err(ResilienceError::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    Self::notify(policy, attempt, &error, delay);
                    debug!(attempt, ?delay, "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt, evaluated by the circuit breaker when configured.
    async fn attempt<F, Fut, T, E>(&self, operation: &mut F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match &self.breaker {
            Some(breaker) => breaker.protect(|| operation()).await,
            None => operation().await.map_err(|source| ResilienceError::Operation { source }),
        }
    }

    /// Rejections are never retried; other failures consult the policy's
    /// predicate with the domain error when one is carried.
    fn retryable<E>(policy: &RetryPolicy, error: &ResilienceError<E>) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if error.is_rejection() {
            return false;
        }
        match error {
            ResilienceError::Operation { source } => policy.should_retry(source),
            other => policy.should_retry(other),
        }
    }

    fn notify<E>(policy: &RetryPolicy, attempt: u32, error: &ResilienceError<E>, delay: Duration)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match error {
            ResilienceError::Operation { source } => policy.notify_retry(attempt, source, delay),
            other => policy.notify_retry(attempt, other, delay),
        }
    }
}
