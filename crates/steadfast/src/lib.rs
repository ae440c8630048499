//! Resilience primitives for fault-tolerant async services.
//!
//! This crate provides **generic, reusable** resilience patterns:
//!
//! - [`retry`]: configurable backoff (fixed, linear, exponential, jitter)
//!   with retry predicates and an event callback
//! - [`bulkhead`]: concurrency limiting with optional bounded waiting
//! - [`breaker`]: a per-endpoint circuit breaker state machine with
//!   metrics and a pluggable clock for deterministic tests
//! - [`saga`]: multi-step workflows with automatic compensation of
//!   completed steps on failure, sequential or parallel
//! - [`builder`]: composition of timeout, bulkhead, retry, and circuit
//!   breaker around one task in a fixed layering order
//!
//! The implementations are generic over domain error types, polymorphic
//! per call (one breaker or bulkhead instance guards calls of different
//! return types), and hold no cross-run state outside the two shared
//! components (breaker, bulkhead) that exist to be shared.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod breaker;
pub mod builder;
pub mod bulkhead;
pub mod clock;
pub mod error;
pub mod retry;
pub mod saga;
pub mod scope;

// Re-export commonly used types for convenience
// ------------------------------
pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use builder::ResilienceBuilder;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadMetrics};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{BoxedError, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
pub use retry::{BackoffStrategy, Retry, RetryEvent, RetryPolicy, RetryPolicyBuilder};
pub use saga::{CompensationOutcome, Saga, SagaError, SagaStep};
