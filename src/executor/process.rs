//! Process-pool executor and the command-backed task it runs.
//!
//! The process pool runs each attempt as a child process built from the
//! task's [`CommandSpec`]. Isolation is real: a crashing attempt takes down
//! its own process only, and cancellation kills the child outright instead
//! of waiting for it to cooperate. The price is that only tasks with a
//! transferable command form can run here.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{cancelled_error, Executor, ExecutorError, TaskOutcome};
use crate::core::resource::ResourceScope;
use crate::core::retry::RetryPolicy;
use crate::core::task::{CommandSpec, Task, TaskError, WorkContext};

/// Run a command spec to completion and map its exit status to an outcome.
///
/// Stdout is the attempt's result: parsed as JSON when it is valid JSON,
/// carried as a plain string otherwise. A non-zero exit code fails the
/// attempt with the code and captured stderr; death by signal is reported
/// as a crash. The child is spawned with `kill_on_drop`, so abandoning the
/// wait (timeout, cancellation) terminates it.
pub(crate) async fn run_command(
    spec: &CommandSpec,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        TaskError::ExecutionFailed(format!("failed to spawn {}: {}", spec.program, err))
    })?;
    let wait = child.wait_with_output();

    let collected = match limit {
        Some(limit) => tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled_error()),
            bounded = tokio::time::timeout(limit, wait) => match bounded {
                Ok(done) => done,
                Err(_) => return Err(TaskError::Timeout(limit)),
            },
        },
        None => tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled_error()),
            done = wait => done,
        },
    };

    let output = collected
        .map_err(|err| TaskError::ExecutionFailed(format!("failed to collect output: {}", err)))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string())))
    } else if let Some(code) = output.status.code() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TaskError::ExecutionFailed(format!(
            "exit code {}: {}",
            code,
            stderr.trim()
        )))
    } else {
        Err(TaskError::Crashed(
            "child terminated by signal".to_string(),
        ))
    }
}

/// Executor that runs each attempt as a child process.
///
/// Requires the task to expose a [`CommandSpec`] via [`Task::command`];
/// tasks without one fail with a validation error, which is terminal, since
/// no amount of retrying will grow the task a command form.
pub struct ProcessPoolExecutor {
    workers: usize,
    semaphore: Arc<Semaphore>,
}

impl ProcessPoolExecutor {
    /// Create a pool that runs at most `workers` child processes at once.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }
}

impl Default for ProcessPoolExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl Executor for ProcessPoolExecutor {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        ctx: WorkContext,
    ) -> Result<TaskOutcome, ExecutorError> {
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Unavailable("process pool shut down".to_string()))?;

        let Some(spec) = task.command() else {
            return Ok(Err(TaskError::Validation(format!(
                "task '{}' has no command form and cannot run in a process pool",
                task.name()
            ))));
        };

        let scope = match ResourceScope::acquire_all(task.resources()).await {
            Ok(scope) => scope,
            Err(err) => return Ok(Err(err)),
        };

        let outcome = run_command(&spec, task.timeout(), ctx.cancellation()).await;

        scope.release_all().await;
        Ok(outcome)
    }

    fn kind(&self) -> super::ExecutorKind {
        super::ExecutorKind::ProcessPool
    }

    fn concurrency(&self) -> usize {
        self.workers
    }
}

/// A task whose body is an external command.
///
/// Because the body is a [`CommandSpec`], this task runs on every executor:
/// the inline and pooled executors invoke the command in-process through
/// [`Task::invoke`], and the process pool hands the spec to a child directly.
///
/// # Example
///
/// ```ignore
/// use flowforge::CommandTask;
/// use std::time::Duration;
///
/// let task = CommandTask::builder("python")
///     .name("extract")
///     .args(["-m", "etl.extract", "--source", "s3://bucket/raw"])
///     .env("AWS_REGION", "us-east-1")
///     .timeout(Duration::from_secs(300))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct CommandTask {
    name: String,
    spec: CommandSpec,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl CommandTask {
    /// Create a new builder for a command task.
    pub fn builder(program: impl Into<String>) -> CommandTaskBuilder {
        CommandTaskBuilder::new(program)
    }

    /// Get the underlying command spec.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &WorkContext) -> Result<Value, TaskError> {
        run_command(&self.spec, None, ctx.cancellation()).await
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn command(&self) -> Option<CommandSpec> {
        Some(self.spec.clone())
    }
}

/// Builder for creating [`CommandTask`] instances.
#[derive(Debug, Clone)]
pub struct CommandTaskBuilder {
    name: Option<String>,
    spec: CommandSpec,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl CommandTaskBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            name: None,
            spec: CommandSpec::new(program),
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Set the task name. Defaults to the program name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec = self.spec.arg(arg);
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec = self.spec.args(args);
        self
    }

    /// Add an environment variable for the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec = self.spec.env(key, value);
        self
    }

    /// Set the working directory for the child process.
    pub fn cwd(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.spec = self.spec.cwd(dir);
        self
    }

    /// Set the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Build the [`CommandTask`].
    pub fn build(self) -> CommandTask {
        let name = self.name.unwrap_or_else(|| self.spec.program.clone());
        CommandTask {
            name,
            spec: self.spec,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
        }
    }
}
