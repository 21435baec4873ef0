//! Task trait, state machine, and error types.
//!
//! A [`Task`] is the unit of work in the engine: a named body that either
//! produces a [`serde_json::Value`] or fails with a [`TaskError`]. The engine
//! does not interpret the produced value; it records it for downstream
//! consumers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::resource::ResourceHook;
use super::retry::RetryPolicy;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task's precondition was never met; retrying cannot help.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Task body raised a failure.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The attempt exceeded its time budget.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// A worker process died before reporting a result.
    #[error("worker crashed: {0}")]
    Crashed(String),
}

impl TaskError {
    /// Whether a retry could plausibly change the outcome.
    ///
    /// Validation failures are configuration errors; they are terminal on
    /// the first occurrence.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Validation(_))
    }
}

/// Lifecycle state of a task within a run.
///
/// Transitions are owned exclusively by the scheduler's control loop:
/// `Pending -> Running -> {Success | RetryWait -> Pending | Failed}`, with
/// `Skipped` reachable from `Pending` when an upstream task fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for dependencies and a worker slot.
    #[default]
    Pending,
    /// Body is in flight on an executor.
    Running,
    /// Failed, waiting out a retry delay before re-entering `Pending`.
    RetryWait,
    /// Terminal: body completed and returned a value.
    Success,
    /// Terminal: body failed and retries are exhausted.
    Failed,
    /// Terminal: never ran because an upstream task failed or was skipped.
    Skipped,
}

impl TaskState {
    /// Whether this state is terminal (the task will never run again).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// A serializable description of an external command.
///
/// This is the transferable form of a task body: it can cross a process
/// boundary, so the process-pool executor requires it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set for the child process.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Create a spec for a program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory for the child process.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Per-attempt context handed to a task body.
///
/// Carries the attempt number (1-indexed) and a cancellation token that a
/// cooperating body may observe. Executors that cannot preempt a body rely
/// on the body checking [`WorkContext::is_cancelled`] at convenient points.
#[derive(Debug, Clone)]
pub struct WorkContext {
    attempt: u32,
    cancel: CancellationToken,
}

impl WorkContext {
    /// Create a context for the given attempt.
    pub fn new(attempt: u32, cancel: CancellationToken) -> Self {
        Self { attempt, cancel }
    }

    /// The attempt number, starting at 1 for the first execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation of this attempt has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation token for this attempt.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for WorkContext {
    fn default() -> Self {
        Self::new(1, CancellationToken::new())
    }
}

/// The core trait for defining executable tasks.
///
/// # Example
///
/// ```ignore
/// use flowforge::{Task, TaskError, WorkContext};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct RowCounter;
///
/// #[async_trait]
/// impl Task for RowCounter {
///     fn name(&self) -> &str {
///         "count_rows"
///     }
///
///     async fn invoke(&self, _ctx: &WorkContext) -> Result<Value, TaskError> {
///         Ok(json!({ "rows": 1000 }))
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Returns the unique name for this task. Immutable after creation.
    fn name(&self) -> &str;

    /// Execute the task body.
    ///
    /// # Returns
    /// * `Ok(value)` - The task's result, recorded but not interpreted.
    /// * `Err(TaskError)` - Task failed; the scheduler consults the retry policy.
    async fn invoke(&self, ctx: &WorkContext) -> Result<Value, TaskError>;

    /// Returns the retry policy for this task.
    ///
    /// Default implementation returns no retries.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Per-attempt time budget. `None` means unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Resources to acquire before the body runs and release after it
    /// finishes, on every exit path.
    fn resources(&self) -> Vec<Arc<dyn ResourceHook>> {
        Vec::new()
    }

    /// A transferable form of the body, if one exists.
    ///
    /// Required by the process-pool executor; other executors ignore it.
    fn command(&self) -> Option<CommandSpec> {
        None
    }

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}
