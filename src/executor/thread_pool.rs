//! Pooled executor backed by the async runtime.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{invoke_scoped, Executor, ExecutorError, TaskOutcome};
use crate::core::task::{Task, TaskError, WorkContext};

/// Executor that spawns each body onto the runtime, bounded by a semaphore.
///
/// At most `workers` attempts run at once; further calls to
/// [`run`](Executor::run) queue on the semaphore. A body that panics is
/// contained by the spawned task and reported as [`TaskError::Crashed`], so
/// one misbehaving task cannot take down the control loop.
///
/// Cancellation is cooperative: the body future is dropped at its next await
/// point. A body stuck in a blocking section keeps running until its next
/// yield.
pub struct ThreadPoolExecutor {
    workers: usize,
    semaphore: Arc<Semaphore>,
}

impl ThreadPoolExecutor {
    /// Create a pool that runs at most `workers` attempts concurrently.
    ///
    /// A worker count of zero is bumped to one; a pool that can never grant
    /// a permit would deadlock the run.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Get the number of currently available worker slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ThreadPoolExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        ctx: WorkContext,
    ) -> Result<TaskOutcome, ExecutorError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Unavailable("worker pool shut down".to_string()))?;

        let handle = tokio::spawn(async move {
            let outcome = invoke_scoped(&task, &ctx).await;
            drop(permit);
            outcome
        });

        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(join_err) => {
                tracing::error!(error = %join_err, "task body aborted its worker");
                Ok(Err(TaskError::Crashed(join_err.to_string())))
            }
        }
    }

    fn kind(&self) -> super::ExecutorKind {
        super::ExecutorKind::ThreadPool
    }

    fn concurrency(&self) -> usize {
        self.workers
    }
}
