//! Structured-concurrency join helpers
//!
//! A scope spawns a fixed set of child tasks and joins them under an
//! explicit policy:
//!
//! - [`all_succeed`] cancels the remaining siblings on the first failure and
//!   fails with that error (fail-fast).
//! - [`accumulating`] runs every task to completion regardless of individual
//!   failures and collects every outcome.
//!
//! The saga's `parallel` uses `all_succeed` for forward execution and
//! `accumulating` for compensation.

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::debug;

/// Run every task; on the first failure abort the remaining siblings, wait
/// for them to unwind, and return that failure.
///
/// On success the results are returned in spawn order.
pub async fn all_succeed<T, E>(tasks: Vec<BoxFuture<'static, Result<T, E>>>) -> Result<Vec<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let count = tasks.len();
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (index, task.await) });
    }

    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(value))) => slots[index] = Some(value),
            Ok((index, Err(error))) => {
                debug!(branch = index, "scope child failed, aborting siblings");
                set.abort_all();
                // Wait for the siblings to actually stop before reporting
                // the failure, so the caller observes a quiesced scope.
                while set.join_next().await.is_some() {}
                return Err(error);
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    std::panic::resume_unwind(join_error.into_panic());
                }
                // Aborted sibling; nothing to record.
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Run every task to completion and collect every outcome in spawn order.
pub async fn accumulating<T, E>(tasks: Vec<BoxFuture<'static, Result<T, E>>>) -> Vec<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let count = tasks.len();
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (index, task.await) });
    }

    let mut slots: Vec<Option<Result<T, E>>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(join_error) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}
