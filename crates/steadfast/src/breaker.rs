//! Circuit breaker state machine
//!
//! A [`CircuitBreaker`] is a shared, per-endpoint gate that fails fast once
//! observed failures cross a threshold and self-probes recovery:
//!
//! - **Closed**: calls run; failures matching the failure predicate bump a
//!   consecutive-failure counter that a success resets. Crossing
//!   `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected immediately with a retry-after hint; the
//!   task never runs. After `open_duration` the next call is admitted as a
//!   trial, moving to half-open.
//! - **Half-open**: calls run as trials. `success_threshold` consecutive
//!   successes close the circuit; any failure re-opens it.
//!
//! All transitions, counters, and metrics live in one mutex-guarded state
//! struct so concurrent callers never observe a torn read. A single breaker
//! instance guards calls of heterogeneous return types: [`protect`] is
//! generic per call.
//!
//! [`protect`]: CircuitBreaker::protect

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

type FailurePredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests.
    Closed,
    /// Circuit is open, rejecting requests.
    Open,
    /// Circuit is half-open, probing recovery with trial requests.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behaviour.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive matching failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing recovery.
    pub open_duration: Duration,
    /// Per-call timeout applied to the protected task; timeouts count as
    /// failures. `None` leaves the task unbounded.
    pub call_timeout: Option<Duration>,
    failure_predicate: FailurePredicate,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_duration", &self.open_duration)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            call_timeout: None,
            failure_predicate: Arc::new(|_| true),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Whether this domain error counts against the failure threshold.
    pub fn matches_failure(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        (self.failure_predicate)(error)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Count only errors matching `predicate` against the failure threshold.
    pub fn failure_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.failure_predicate = Arc::new(predicate);
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics snapshot for circuit breaker monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_transitions: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_state_change: Instant,
}

/// Single-writer breaker state: every transition and counter mutation
/// happens while holding the one lock around this struct.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    state_transitions: u64,
    opened_at: Option<Instant>,
    last_state_change: Instant,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            state_transitions: 0,
            opened_at: None,
            last_state_change: now,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.state_transitions += 1;
        self.last_state_change = now;
        self.opened_at = if to == CircuitState::Open { Some(now) } else { None };
    }
}

enum CallFailure<E> {
    Domain(E),
    TimedOut(Duration),
}

/// Shared, long-lived circuit breaker for one logical endpoint.
///
/// Clones share the same state, so the instance created for a resource can
/// be handed to every call site protecting that resource.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker on the system clock.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with default configuration.
    pub fn with_defaults() -> Self {
        let config = CircuitBreakerConfig::default();
        let clock = SystemClock;
        let now = clock.now();
        Self { config, inner: Arc::new(Mutex::new(BreakerState::new(now))), clock: Arc::new(clock) }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for tests).
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::new(now))),
            clock: Arc::new(clock),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute `operation` under circuit breaker protection.
    ///
    /// The configured `call_timeout` is applied to the task before its
    /// result is classified; a timeout counts as a failure. Domain errors
    /// not matching the failure predicate propagate without touching the
    /// failure counters.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn protect<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Err(retry_after) = self.try_admit() {
            debug!("circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen { retry_after });
        }

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(CallFailure::Domain),
                Err(_) => Err(CallFailure::TimedOut(limit)),
            },
            None => operation().await.map_err(CallFailure::Domain),
        };

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(CallFailure::TimedOut(limit)) => {
                self.record_failure();
                warn!(timeout = ?limit, "protected call timed out");
                Err(ResilienceError::Timeout { timeout: limit })
            }
            Err(CallFailure::Domain(error)) => {
                if self.config.matches_failure(&error) {
                    self.record_failure();
                } else {
                    debug!("error does not match failure predicate, not counted");
                }
                Err(ResilienceError::Operation { source: error })
            }
        }
    }

    /// Execute `operation`, substituting `fallback(error)` whenever the
    /// call or the open-circuit rejection fails.
    pub async fn protect_with_fallback<F, Fut, FB, FutB, T, E>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(ResilienceError<E>) -> FutB,
        FutB: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.protect(operation).await {
            Ok(value) => Ok(value),
            Err(error) => {
                debug!("substituting fallback for failed call");
                fallback(error).await.map_err(|source| ResilienceError::Operation { source })
            }
        }
    }

    /// Decide whether a call may proceed. Rejections carry the remaining
    /// time until the breaker probes recovery.
    fn try_admit(&self) -> Result<(), Option<Duration>> {
        let now = self.clock.now();
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                state.total_calls += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    state.transition(CircuitState::HalfOpen, now);
                    state.consecutive_successes = 0;
                    state.total_calls += 1;
                    info!("circuit breaker half-open, probing recovery");
                    Ok(())
                } else {
                    state.rejected_calls += 1;
                    Err(self.config.open_duration.checked_sub(elapsed))
                }
            }
        }
    }

    fn record_success(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.successful_calls += 1;
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            state.transition(CircuitState::Closed, now);
            info!(
                successes = state.consecutive_successes,
                "circuit breaker closed after successful trials"
            );
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.failed_calls += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.transition(CircuitState::Open, now);
                    warn!(
                        failures = state.consecutive_failures,
                        "circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.transition(CircuitState::Open, now);
                warn!("circuit breaker re-opened by half-open failure");
            }
            // A call admitted earlier may finish after the circuit opened;
            // only the counters change.
            CircuitState::Open => {}
        }
    }

    /// Current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock();
        CircuitBreakerMetrics {
            state: state.state,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            state_transitions: state.state_transitions,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_state_change: state.last_state_change,
        }
    }

    /// Return the breaker to the closed state and clear its counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        *state = BreakerState::new(now);
        info!("circuit breaker manually reset to closed state");
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}
