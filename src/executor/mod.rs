//! Task execution strategies.
//!
//! An [`Executor`] runs a single task attempt and reports how it went. The
//! scheduler owns all bookkeeping; executors only turn a [`Task`] plus a
//! [`WorkContext`] into a [`TaskOutcome`]. Three strategies are provided:
//!
//! - [`InlineExecutor`](inline::InlineExecutor) awaits the body directly on
//!   the control loop's task, one at a time. Deterministic; for tests and
//!   debugging.
//! - [`ThreadPoolExecutor`](thread_pool::ThreadPoolExecutor) spawns bodies
//!   onto the runtime, bounded by a semaphore.
//! - [`ProcessPoolExecutor`](process::ProcessPoolExecutor) runs each attempt
//!   as a child process built from the task's [`CommandSpec`], which allows
//!   true preemption and isolates crashes.
//!
//! A scheduler must observe the same task outcomes regardless of which
//! executor ran the workflow; only timing and isolation differ.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::core::resource::ResourceScope;
use crate::core::task::{Task, TaskError, WorkContext};

pub mod inline;
pub mod process;
pub mod thread_pool;

pub use inline::InlineExecutor;
pub use process::{CommandTask, ProcessPoolExecutor};
pub use thread_pool::ThreadPoolExecutor;

/// How one attempt of a task ended, assuming the executor itself stayed
/// healthy.
pub type TaskOutcome = Result<Value, TaskError>;

/// Errors from the execution machinery itself, as opposed to task failures.
///
/// These are fatal to the run: if the executor cannot provide workers at
/// all, retrying individual tasks cannot help.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor cannot accept work.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Strategy for running one task attempt.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one attempt of `task` to completion.
    ///
    /// `Err(ExecutorError)` means the machinery failed; `Ok(Err(TaskError))`
    /// means the machinery worked and the task itself failed.
    async fn run(&self, task: Arc<dyn Task>, ctx: WorkContext) -> Result<TaskOutcome, ExecutorError>;

    /// Which strategy this executor implements.
    fn kind(&self) -> ExecutorKind;

    /// Maximum number of attempts this executor runs concurrently.
    fn concurrency(&self) -> usize;
}

/// Selector for the executor strategy, usable in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Await bodies directly, one at a time.
    Inline,
    /// Spawn bodies onto the async runtime, bounded by a worker count.
    #[default]
    ThreadPool,
    /// Run each attempt as a child process.
    ProcessPool,
}

/// Construct an executor of the given kind.
pub fn build_executor(kind: ExecutorKind, workers: usize) -> Arc<dyn Executor> {
    match kind {
        ExecutorKind::Inline => Arc::new(InlineExecutor::new()),
        ExecutorKind::ThreadPool => Arc::new(ThreadPoolExecutor::new(workers)),
        ExecutorKind::ProcessPool => Arc::new(ProcessPoolExecutor::new(workers)),
    }
}

/// Run a task body with its resource hooks and time budget applied.
///
/// Hooks are acquired before the body starts and released on every exit
/// path. The timeout covers only the body, not acquisition. Cancellation
/// drops the body future and reports the attempt as cancelled; held hooks
/// are still released.
pub(crate) async fn invoke_scoped(task: &Arc<dyn Task>, ctx: &WorkContext) -> TaskOutcome {
    let scope = match ResourceScope::acquire_all(task.resources()).await {
        Ok(scope) => scope,
        Err(err) => return Err(err),
    };

    let outcome = invoke_bounded(task, ctx).await;

    scope.release_all().await;
    outcome
}

async fn invoke_bounded(task: &Arc<dyn Task>, ctx: &WorkContext) -> TaskOutcome {
    let body = task.invoke(ctx);
    match task.timeout() {
        Some(limit) => tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(cancelled_error()),
            bounded = tokio::time::timeout(limit, body) => match bounded {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::Timeout(limit)),
            },
        },
        None => tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(cancelled_error()),
            outcome = body => outcome,
        },
    }
}

pub(crate) fn cancelled_error() -> TaskError {
    TaskError::ExecutionFailed("attempt cancelled".to_string())
}
