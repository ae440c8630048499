//! Retry with configurable backoff
//!
//! A [`RetryPolicy`] is an immutable value describing how many attempts to
//! make, how long to wait between them, and which errors are worth retrying.
//! [`Retry::execute`] runs a fallible async operation under a policy.
//!
//! Execution is lazy: nothing runs until the returned future is polled, and
//! two executions of the same policy share no state. Cancelling (dropping)
//! the future during a backoff wait aborts the wait without issuing the
//! next attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

type Predicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;
type RetryListener = Arc<dyn Fn(&RetryEvent<'_>) + Send + Sync>;

/// Backoff strategy for calculating the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay between every attempt.
    Fixed,
    /// Delay grows linearly: `initial_delay * attempt`.
    Linear,
    /// Delay grows geometrically: `initial_delay * multiplier^(attempt - 1)`.
    Exponential,
    /// Exponential delay randomised uniformly in `[0, exponential]`.
    ExponentialJitter,
}

/// One retry occurrence, handed to the `on_retry` callback just before the
/// backoff wait begins.
pub struct RetryEvent<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// The error that triggered this retry.
    pub error: &'a (dyn std::error::Error + 'static),
    /// How long the policy will wait before the next attempt.
    pub next_delay: Duration,
    /// Wall-clock time the event was created.
    pub timestamp: SystemTime,
}

impl fmt::Debug for RetryEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEvent")
            .field("attempt", &self.attempt)
            .field("error", &self.error.to_string())
            .field("next_delay", &self.next_delay)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Immutable retry policy.
///
/// Build one with the factory methods ([`RetryPolicy::fixed`],
/// [`RetryPolicy::exponential`], ...) or [`RetryPolicy::builder`], then
/// refine it with the `with_*` copy-update methods.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (always >= 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// How the delay evolves across attempts.
    pub backoff: BackoffStrategy,
    /// Growth factor for the exponential strategies.
    pub multiplier: f64,
    /// Upper bound applied to every computed delay.
    pub max_delay: Duration,
    retry_predicate: Predicate,
    on_retry: Option<RetryListener>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff", &self.backoff)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential,
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retry_predicate: Arc::new(|_| true),
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> ConfigResult<Self> {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(delay)
            .backoff(BackoffStrategy::Fixed)
            .max_delay(delay)
            .build()
    }

    /// Policy whose delay grows linearly with the attempt number.
    pub fn linear(max_attempts: u32, initial_delay: Duration) -> ConfigResult<Self> {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(initial_delay)
            .backoff(BackoffStrategy::Linear)
            .build()
    }

    /// Policy with exponentially increasing delays (multiplier 2.0).
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> ConfigResult<Self> {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(initial_delay)
            .backoff(BackoffStrategy::Exponential)
            .build()
    }

    /// Exponential backoff with full jitter, spreading out retry storms.
    pub fn exponential_with_jitter(
        max_attempts: u32,
        initial_delay: Duration,
    ) -> ConfigResult<Self> {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(initial_delay)
            .backoff(BackoffStrategy::ExponentialJitter)
            .build()
    }

    /// Policy that never retries: the first failure is final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            retry_predicate: Arc::new(|_| false),
            on_retry: None,
        }
    }

    /// Create a policy builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Copy of this policy with a different maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> ConfigResult<Self> {
        self.max_attempts = max_attempts;
        self.validate()?;
        Ok(self)
    }

    /// Copy of this policy with a different initial delay.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Copy of this policy with a different backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> ConfigResult<Self> {
        self.multiplier = multiplier;
        self.validate()?;
        Ok(self)
    }

    /// Copy of this policy with a different delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Copy of this policy that retries only errors matching `predicate`.
    ///
    /// The predicate receives the error as `&dyn Error`; downcast to inspect
    /// a concrete type.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    /// Copy of this policy invoking `listener` once per retry, immediately
    /// before each backoff wait.
    pub fn on_retry<L>(mut self, listener: L) -> Self
    where
        L: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(listener));
        self
    }

    /// Whether the given error should trigger a retry.
    pub fn should_retry(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        (self.retry_predicate)(error)
    }

    /// Delay before the attempt following the failed 1-based `attempt`.
    ///
    /// Every strategy caps the result at `max_delay`; the jitter strategy is
    /// additionally bounded above by the un-jittered exponential value.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let computed = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialJitter => {
                let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (self.initial_delay.as_millis() as f64 * factor)
                    .min(self.max_delay.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        };

        let capped = computed.min(self.max_delay);
        if self.backoff == BackoffStrategy::ExponentialJitter && !capped.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
            Duration::from_millis(millis)
        } else {
            capped
        }
    }

    pub(crate) fn notify_retry(
        &self,
        attempt: u32,
        error: &(dyn std::error::Error + 'static),
        next_delay: Duration,
    ) {
        if let Some(listener) = &self.on_retry {
            let event = RetryEvent { attempt, error, next_delay, timestamp: SystemTime::now() };
            listener(&event);
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if matches!(self.backoff, BackoffStrategy::Linear | BackoffStrategy::Exponential
            | BackoffStrategy::ExponentialJitter)
            && self.multiplier <= 0.0
        {
            return Err(ConfigError::invalid("multiplier must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`] with a fluent API.
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.policy.initial_delay = initial_delay;
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.policy.backoff = backoff;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.policy.max_delay = max_delay;
        self
    }

    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.policy = self.policy.retry_if(predicate);
        self
    }

    pub fn on_retry<L>(mut self, listener: L) -> Self
    where
        L: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.policy = self.policy.on_retry(listener);
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Retry executor.
pub struct Retry;

impl Retry {
    /// Execute `operation` under `policy`.
    ///
    /// Errors not matching the retry predicate propagate immediately as
    /// [`ResilienceError::Operation`] without consuming an attempt; once
    /// attempts are exhausted the last failure is wrapped in
    /// [`ResilienceError::RetryExhausted`].
    #[instrument(skip(policy, operation), fields(max_attempts = policy.max_attempts))]
    pub async fn execute<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !policy.should_retry(&error) {
                        debug!(attempt, "error is not retryable, propagating");
                        return Err(ResilienceError::Operation { source: error });
                    }
                    if attempt >= policy.max_attempts {
                        warn!(attempts = attempt, "retry attempts exhausted");
                        return Err(ResilienceError::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(ResilienceError::Operation { source: error }),
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    policy.notify_retry(attempt, &error, delay);
                    debug!(attempt, ?delay, "operation failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
