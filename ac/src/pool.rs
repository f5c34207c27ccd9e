//! Bounded-parallelism batch executor
//!
//! Runs a batch with at most `max_concurrent` tasks in flight and returns
//! one result per task in input order. Admission blocks on a semaphore;
//! after cancellation no further task starts, but tasks already running
//! finish on their own (they observe the same signal through their own
//! token). `max_concurrent` of zero runs nothing.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-task disposition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolTaskResult<T> {
    Completed(T),
    /// Never started: cancellation beat it to a slot
    Cancelled,
}

impl<T> PoolTaskResult<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }
}

/// Run `tasks` with bounded parallelism; results come back in input order
pub async fn run_tasks<T, F, Fut>(tasks: Vec<F>, max_concurrent: usize, cancel: &CancellationToken) -> Vec<PoolTaskResult<T>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let total = tasks.len();
    if max_concurrent == 0 || cancel.is_cancelled() {
        return (0..total).map(|_| PoolTaskResult::Cancelled).collect();
    }

    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut handles = Vec::with_capacity(total);

    for task in tasks {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return PoolTaskResult::Cancelled,
                permit = semaphore.acquire_owned() => permit,
            };
            let _permit = match permit {
                Ok(p) => p,
                Err(_) => return PoolTaskResult::Cancelled,
            };
            if cancel.is_cancelled() {
                return PoolTaskResult::Cancelled;
            }
            PoolTaskResult::Completed(task().await)
        }));
    }

    let mut results = Vec::with_capacity(total);
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(error = %e, "pool task join failed");
                results.push(PoolTaskResult::Cancelled);
            }
        }
    }
    results
}
