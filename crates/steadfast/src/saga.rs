//! Saga pattern: multi-step workflows with compensating actions
//!
//! A [`Saga`] is a lazy composition of steps, each pairing a forward action
//! with a compensating action that undoes it. Running the saga executes the
//! steps in declaration order; on the first failure every *already
//! completed* step is compensated in reverse order. Compensation failures
//! are collected, never short-circuited — every completed step gets its
//! compensation attempted.
//!
//! Compensation is registered the moment a step's action succeeds, before
//! any later await point. That register-then-attempt ordering is what lets
//! a parallel branch cancelled mid-flight still compensate everything it
//! had completed.
//!
//! Building a saga performs no work; two runs of sagas built from the same
//! constructors share no state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::scope;

/// Outcome of one attempted compensation.
#[derive(Debug)]
pub struct CompensationOutcome<E> {
    /// Name of the compensated step.
    pub step: String,
    /// Whether the compensating action itself succeeded.
    pub result: Result<(), E>,
}

impl<E> CompensationOutcome<E> {
    /// Whether the compensating action succeeded.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// A failed saga run: the original step failure plus the outcome of every
/// compensation attempted, in attempt order.
#[derive(Debug, Error)]
#[error("saga step '{failed_step}' failed; {} compensation(s) attempted", compensation.len())]
pub struct SagaError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Name of the step whose action failed.
    pub failed_step: String,
    /// The original failure.
    #[source]
    pub source: E,
    /// One entry per attempted compensation, success or failure.
    pub compensation: Vec<CompensationOutcome<E>>,
}

impl<E> SagaError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether every attempted compensation succeeded.
    pub fn fully_compensated(&self) -> bool {
        self.compensation.iter().all(CompensationOutcome::succeeded)
    }
}

/// One named step: a forward action paired with its compensating action.
///
/// The action's result is cloned at registration time: one copy flows to
/// the next step, the other is captured by the compensation.
pub struct SagaStep<T, E> {
    name: String,
    action: Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>,
    compensate: Box<dyn FnOnce(T) -> BoxFuture<'static, Result<(), E>> + Send>,
}

impl<T, E> SagaStep<T, E> {
    /// Create a step from a forward action and its compensation.
    pub fn new<F, Fut, C, CFut>(name: impl Into<String>, action: F, compensate: C) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(T) -> CFut + Send + 'static,
        CFut: std::future::Future<Output = Result<(), E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || action().boxed()),
            compensate: Box::new(move |value| compensate(value).boxed()),
        }
    }

    /// The step's name, used in failure reports and compensation outcomes.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T, E> fmt::Debug for SagaStep<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep").field("name", &self.name).finish()
    }
}

/// A registered, ready-to-run compensating action.
struct Compensation<E> {
    step: String,
    undo: BoxFuture<'static, Result<(), E>>,
}

/// Shared log of compensations registered by completed steps.
///
/// The log lives in an `Arc` so registrations made by a branch survive that
/// branch being aborted.
struct CompensationLog<E> {
    entries: Arc<Mutex<Vec<Compensation<E>>>>,
}

impl<E> Clone for CompensationLog<E> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries) }
    }
}

impl<E> CompensationLog<E> {
    fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(Vec::new())) }
    }

    fn register(&self, step: &str, undo: BoxFuture<'static, Result<(), E>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(Compensation { step: step.to_string(), undo });
    }

    fn drain(&self) -> Vec<Compensation<E>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *entries)
    }

    fn append(&self, additions: Vec<Compensation<E>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.extend(additions);
    }

    /// Run every registered compensation in reverse registration order,
    /// collecting every outcome. Failures never stop the unwind.
    async fn unwind(self) -> Vec<CompensationOutcome<E>> {
        let mut entries = self.drain();
        entries.reverse();

        let mut outcomes = Vec::with_capacity(entries.len());
        for compensation in entries {
            debug!(step = %compensation.step, "running compensation");
            let result = compensation.undo.await;
            if result.is_err() {
                warn!(step = %compensation.step, "compensation failed");
            }
            outcomes.push(CompensationOutcome { step: compensation.step, result });
        }
        outcomes
    }
}

/// A step failure travelling up the saga chain, carrying any compensation
/// outcomes an inner combinator (parallel) has already collected.
struct StepFailure<E> {
    step: String,
    error: E,
    prior_compensation: Vec<CompensationOutcome<E>>,
}

type SagaFuture<T, E> = BoxFuture<'static, Result<T, StepFailure<E>>>;
type SagaFn<T, E> = Box<dyn FnOnce(CompensationLog<E>) -> SagaFuture<T, E> + Send>;

/// A lazy, composable saga producing `T` or failing with a step error `E`.
pub struct Saga<T, E> {
    run_fn: SagaFn<T, E>,
}

impl<T, E> fmt::Debug for Saga<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga").finish_non_exhaustive()
    }
}

impl<T, E> Saga<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Saga consisting of a single step.
    pub fn single(step: SagaStep<T, E>) -> Self
    where
        T: Clone,
    {
        let SagaStep { name, action, compensate } = step;
        Self {
            run_fn: Box::new(move |log| {
                async move {
                    debug!(step = %name, "executing saga step");
                    match action().await {
                        Ok(value) => {
                            // Register before any later await point so a
                            // cancelled branch still compensates this step.
                            log.register(&name, compensate(value.clone()));
                            Ok(value)
                        }
                        Err(error) => Err(StepFailure {
                            step: name,
                            error,
                            prior_compensation: Vec::new(),
                        }),
                    }
                }
                .boxed()
            }),
        }
    }

    /// Saga consisting of a single named step (convenience constructor).
    pub fn step<F, Fut, C, CFut>(name: impl Into<String>, action: F, compensate: C) -> Self
    where
        T: Clone,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(T) -> CFut + Send + 'static,
        CFut: std::future::Future<Output = Result<(), E>> + Send + 'static,
    {
        Self::single(SagaStep::new(name, action, compensate))
    }

    /// Append a dependent step: its action receives the previous result.
    pub fn and_then<U, F, Fut, C, CFut>(
        self,
        name: impl Into<String>,
        action: F,
        compensate: C,
    ) -> Saga<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<U, E>> + Send + 'static,
        C: FnOnce(U) -> CFut + Send + 'static,
        CFut: std::future::Future<Output = Result<(), E>> + Send + 'static,
    {
        let name = name.into();
        let previous = self.run_fn;
        Saga {
            run_fn: Box::new(move |log| {
                async move {
                    let value = previous(log.clone()).await?;
                    debug!(step = %name, "executing saga step");
                    match action(value).await {
                        Ok(next) => {
                            log.register(&name, compensate(next.clone()).boxed());
                            Ok(next)
                        }
                        Err(error) => Err(StepFailure {
                            step: name,
                            error,
                            prior_compensation: Vec::new(),
                        }),
                    }
                }
                .boxed()
            }),
        }
    }

    /// Transform the saga's result with a pure function (no compensation).
    pub fn map<U, F>(self, f: F) -> Saga<U, E>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let previous = self.run_fn;
        Saga { run_fn: Box::new(move |log| async move { previous(log).await.map(f) }.boxed()) }
    }

    /// Sequence another saga computed from this saga's result.
    pub fn flat_map<U, F>(self, f: F) -> Saga<U, E>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Saga<U, E> + Send + 'static,
    {
        let previous = self.run_fn;
        Saga {
            run_fn: Box::new(move |log| {
                async move {
                    let value = previous(log.clone()).await?;
                    (f(value).run_fn)(log).await
                }
                .boxed()
            }),
        }
    }

    /// Pair this saga with another independent saga.
    ///
    /// Both share one compensation log, so on failure the later-zipped saga
    /// compensates first.
    pub fn zip<U>(self, other: Saga<U, E>) -> Saga<(T, U), E>
    where
        U: Send + 'static,
    {
        let left = self.run_fn;
        let right = other.run_fn;
        Saga {
            run_fn: Box::new(move |log| {
                async move {
                    let a = left(log.clone()).await?;
                    let b = right(log).await?;
                    Ok((a, b))
                }
                .boxed()
            }),
        }
    }

    /// Combine two independent sagas with a function.
    pub fn map2<U, R, F>(self, other: Saga<U, E>, f: F) -> Saga<R, E>
    where
        U: Send + 'static,
        R: Send + 'static,
        F: FnOnce(T, U) -> R + Send + 'static,
    {
        self.zip(other).map(move |(a, b)| f(a, b))
    }

    /// Run independent saga branches concurrently.
    ///
    /// Forward execution is fail-fast: the first branch failure aborts the
    /// remaining branches. Compensation then runs for every branch —
    /// including aborted ones — covering each step a branch had completed,
    /// in reverse of that branch's own completion order. Cross-branch
    /// compensation runs concurrently with no ordering guarantee beyond
    /// "all attempted".
    pub fn parallel(branches: Vec<Saga<T, E>>) -> Saga<Vec<T>, E> {
        Saga {
            run_fn: Box::new(move |log| {
                async move {
                    let mut tasks: Vec<SagaFuture<T, E>> = Vec::with_capacity(branches.len());
                    let mut branch_logs = Vec::with_capacity(branches.len());
                    for branch in branches {
                        let branch_log = CompensationLog::new();
                        branch_logs.push(branch_log.clone());
                        tasks.push((branch.run_fn)(branch_log));
                    }

                    match scope::all_succeed(tasks).await {
                        Ok(values) => {
                            // Hand completed branches' compensations to the
                            // enclosing saga, in branch order.
                            for branch_log in branch_logs {
                                log.append(branch_log.drain());
                            }
                            Ok(values)
                        }
                        Err(mut failure) => {
                            warn!(
                                step = %failure.step,
                                "parallel saga branch failed, compensating all branches"
                            );
                            let unwinds: Vec<
                                BoxFuture<
                                    'static,
                                    Result<Vec<CompensationOutcome<E>>, std::convert::Infallible>,
                                >,
                            > = branch_logs
                                .into_iter()
                                .map(|branch_log| {
                                    async move { Ok(branch_log.unwind().await) }.boxed()
                                })
                                .collect();
                            for outcome in scope::accumulating(unwinds).await {
                                failure.prior_compensation.extend(outcome.unwrap_or_default());
                            }
                            Err(failure)
                        }
                    }
                }
                .boxed()
            }),
        }
    }

    /// Execute the saga, returning the full failure report on error.
    ///
    /// On the first step failure every already-completed step is
    /// compensated in reverse order; the returned [`SagaError`] lists the
    /// outcome of every attempted compensation.
    pub async fn run_safe(self) -> Result<T, SagaError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let log = CompensationLog::new();
        match (self.run_fn)(log.clone()).await {
            Ok(value) => Ok(value),
            Err(failure) => {
                warn!(step = %failure.step, "saga failed, compensating completed steps");
                let mut compensation = failure.prior_compensation;
                compensation.extend(log.unwind().await);
                Err(SagaError {
                    failed_step: failure.step,
                    source: failure.error,
                    compensation,
                })
            }
        }
    }

    /// Execute the saga, propagating only the original step failure.
    ///
    /// Compensation still runs exactly as in [`run_safe`]; use that method
    /// when the compensation outcomes must be inspected.
    ///
    /// [`run_safe`]: Saga::run_safe
    pub async fn run(self) -> Result<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_safe().await.map_err(|saga_error| saga_error.source)
    }
}
