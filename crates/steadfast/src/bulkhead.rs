//! Bulkhead pattern for limiting concurrent operations
//!
//! The bulkhead isolates a resource by capping how many protected tasks can
//! be in flight at once. A single instance guards calls of different return
//! types against the same resource: [`Bulkhead::protect`] is generic per
//! call, not per instance.
//!
//! Permits are released by RAII, so completion, failure, and cancellation
//! all return capacity to the pool.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Configuration for bulkhead behaviour.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum number of concurrently executing protected tasks.
    pub max_concurrent: usize,
    /// How long a caller may wait for a permit. `None` rejects immediately
    /// when the pool is empty.
    pub wait_timeout: Option<Duration>,
    /// Whether queued waiters are admitted in FIFO order.
    ///
    /// The tokio semaphore queues waiters fairly either way; the flag is
    /// retained as configuration surface because callers that request
    /// unfair admission accept FIFO as one of the permitted orders.
    pub fair: bool,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, wait_timeout: None, fair: true }
    }
}

impl BulkheadConfig {
    /// Create a configuration builder.
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`].
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.config.wait_timeout = None;
        self
    }

    pub fn fair(mut self, fair: bool) -> Self {
        self.config.fair = fair;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics snapshot for bulkhead monitoring.
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Operations that acquired a permit and ran.
    pub total_operations: u64,
    /// Operations rejected because no permit was free.
    pub rejected_operations: u64,
    /// Rejections that first waited out `wait_timeout`.
    pub timed_out_waits: u64,
    /// Number of protected tasks currently in flight.
    pub current_in_flight: usize,
    /// Configured concurrency limit.
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Current utilization as a fraction in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        self.current_in_flight as f64 / self.max_concurrent as f64
    }

    /// Whether every permit is currently held.
    pub fn is_at_capacity(&self) -> bool {
        self.current_in_flight >= self.max_concurrent
    }
}

/// Concurrency limiter built on a counting semaphore.
///
/// Clones share the same permit pool and counters, so one bulkhead can be
/// handed to many call sites guarding the same resource.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    total_operations: Arc<AtomicU64>,
    rejected_operations: Arc<AtomicU64>,
    timed_out_waits: Arc<AtomicU64>,
}

impl Bulkhead {
    /// Create a new bulkhead with the given configuration.
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            total_operations: Arc::new(AtomicU64::new(0)),
            rejected_operations: Arc::new(AtomicU64::new(0)),
            timed_out_waits: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// Create a bulkhead with default configuration.
    pub fn with_defaults() -> Self {
        let config = BulkheadConfig::default();
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            total_operations: Arc::new(AtomicU64::new(0)),
            rejected_operations: Arc::new(AtomicU64::new(0)),
            timed_out_waits: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Acquire a permit, applying the configured wait policy.
    ///
    /// On rejection the protected task has not run and will not run. The
    /// permit releases its slot when dropped, whatever the outcome of the
    /// work done while holding it.
    pub async fn admit<E>(&self) -> ResilienceResult<SemaphorePermit<'_>, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.config.wait_timeout {
            None => match self.semaphore.try_acquire() {
                Ok(permit) => Ok(permit),
                Err(_) => {
                    self.rejected_operations.fetch_add(1, Ordering::Relaxed);
                    warn!(capacity = self.config.max_concurrent, "bulkhead full, rejecting call");
                    Err(ResilienceError::BulkheadFull { capacity: self.config.max_concurrent })
                }
            },
            Some(wait) => {
                match tokio::time::timeout(wait, self.semaphore.acquire()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    // The semaphore is never closed while the bulkhead is alive.
                    Ok(Err(_)) => {
                        Err(ResilienceError::BulkheadFull { capacity: self.config.max_concurrent })
                    }
                    Err(_) => {
                        self.timed_out_waits.fetch_add(1, Ordering::Relaxed);
                        self.rejected_operations.fetch_add(1, Ordering::Relaxed);
                        warn!(waited = ?wait, "bulkhead wait timed out, rejecting call");
                        Err(ResilienceError::BulkheadFull { capacity: self.config.max_concurrent })
                    }
                }
            }
        }
    }

    /// Execute `operation` under a permit.
    #[instrument(skip(self, operation), fields(in_flight = self.current_in_flight()))]
    pub async fn protect<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.admit().await?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        debug!(in_flight = self.current_in_flight(), "bulkhead admitted operation");

        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => Err(ResilienceError::Operation { source: error }),
        }
        // Permit drops here, releasing the slot.
    }

    /// Number of protected tasks currently holding a permit.
    pub fn current_in_flight(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            total_operations: self.total_operations.load(Ordering::Acquire),
            rejected_operations: self.rejected_operations.load(Ordering::Acquire),
            timed_out_waits: self.timed_out_waits.load(Ordering::Acquire),
            current_in_flight: self.current_in_flight(),
            max_concurrent: self.config.max_concurrent,
        }
    }
}

impl Clone for Bulkhead {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            semaphore: Arc::clone(&self.semaphore),
            total_operations: Arc::clone(&self.total_operations),
            rejected_operations: Arc::clone(&self.rejected_operations),
            timed_out_waits: Arc::clone(&self.timed_out_waits),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_concurrent", &self.config.max_concurrent)
            .field("wait_timeout", &self.config.wait_timeout)
            .field("current_in_flight", &self.current_in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("io failed")]
    struct IoFailed;

    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent(0).build().is_err());
        assert!(BulkheadConfig::builder().max_concurrent(1).build().is_ok());
    }

    #[tokio::test]
    async fn test_protect_basic() {
        let bulkhead = Bulkhead::with_defaults();

        let result = bulkhead.protect(|| async { Ok::<_, IoFailed>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(bulkhead.metrics().total_operations, 1);
    }

    #[tokio::test]
    async fn test_single_instance_guards_heterogeneous_types() {
        let bulkhead = Bulkhead::with_defaults();

        let number = bulkhead.protect(|| async { Ok::<_, IoFailed>(7) }).await.unwrap();
        let text = bulkhead.protect(|| async { Ok::<_, IoFailed>("seven") }).await.unwrap();
        assert_eq!(number, 7);
        assert_eq!(text, "seven");
    }

    #[tokio::test]
    async fn test_oversubscription_rejects_exactly_one() {
        let config = BulkheadConfig::builder().max_concurrent(2).no_wait().build().unwrap();
        let bulkhead = Arc::new(Bulkhead::new(config).unwrap());
        let started = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let bulkhead = Arc::clone(&bulkhead);
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .protect(|| {
                        let started = Arc::clone(&started);
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, IoFailed>(())
                        }
                    })
                    .await
            }));
        }

        // Let the two long-running tasks claim both permits.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        let rejected = bulkhead.protect(|| async { Ok::<_, IoFailed>(()) }).await;
        match rejected {
            Err(ResilienceError::BulkheadFull { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected BulkheadFull, got {other:?}"),
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(bulkhead.metrics().rejected_operations, 1);
    }

    #[tokio::test]
    async fn test_wait_timeout_rejects_without_running_task() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .wait_timeout(Duration::from_millis(30))
            .build()
            .unwrap();
        let bulkhead = Arc::new(Bulkhead::new(config).unwrap());

        let holder = Arc::clone(&bulkhead);
        let blocker = tokio::spawn(async move {
            holder
                .protect(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, IoFailed>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicU32::new(0));
        let ran_inner = Arc::clone(&ran);
        let result = bulkhead
            .protect(|| async move {
                ran_inner.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IoFailed>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::BulkheadFull { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "rejected task must never run");
        assert_eq!(bulkhead.metrics().timed_out_waits, 1);

        assert!(blocker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_timeout_admits_when_permit_frees_up() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .wait_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let bulkhead = Arc::new(Bulkhead::new(config).unwrap());

        let holder = Arc::clone(&bulkhead);
        let blocker = tokio::spawn(async move {
            holder
                .protect(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, IoFailed>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = bulkhead.protect(|| async { Ok::<_, IoFailed>("queued") }).await;
        assert_eq!(result.unwrap(), "queued");

        assert!(blocker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_permit_released_after_failure() {
        let config = BulkheadConfig::builder().max_concurrent(1).no_wait().build().unwrap();
        let bulkhead = Bulkhead::new(config).unwrap();

        let result: ResilienceResult<(), _> =
            bulkhead.protect(|| async { Err(IoFailed) }).await;
        assert!(matches!(result, Err(ResilienceError::Operation { .. })));

        // The slot must be free again.
        let result = bulkhead.protect(|| async { Ok::<_, IoFailed>(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(bulkhead.current_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_cancellation() {
        let config = BulkheadConfig::builder().max_concurrent(1).no_wait().build().unwrap();
        let bulkhead = Arc::new(Bulkhead::new(config).unwrap());

        let inner = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move {
            let _: ResilienceResult<(), IoFailed> = inner
                .protect(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.current_in_flight(), 1);

        handle.abort();
        let _ = handle.await;

        assert_eq!(bulkhead.current_in_flight(), 0, "cancelled task must release its permit");
    }

    #[test]
    fn test_metrics_helpers() {
        let metrics = BulkheadMetrics {
            total_operations: 80,
            rejected_operations: 20,
            timed_out_waits: 5,
            current_in_flight: 5,
            max_concurrent: 10,
        };

        assert_eq!(metrics.utilization(), 0.5);
        assert!(!metrics.is_at_capacity());
    }
}
