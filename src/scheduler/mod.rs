//! Workflow scheduler: the single-writer control loop.
//!
//! The [`Scheduler`] owns a [`WorkflowGraph`] and drives one run of it to
//! completion. All task state lives in a table owned by the control loop;
//! executors and retry timers only send messages back over one channel.
//! Nothing outside the loop ever mutates run state, so there are no locks
//! around it and no torn observations.
//!
//! Loop shape: dispatch every ready task up to the worker budget, then block
//! on the completion channel. Successes unlock dependents, failures consult
//! the retry policy, terminal failures skip everything downstream. The run
//! ends when nothing is in flight, no retry timer is pending, and nothing is
//! ready.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore, PersistenceError, TaskCheckpoint};
use crate::core::graph::{GraphError, WorkflowGraph};
use crate::core::retry::RetryDecision;
use crate::core::task::{TaskState, WorkContext};
use crate::core::types::{RunId, TaskId, WorkflowId};
use crate::events::{Event, EventBus};
use crate::executor::{build_executor, Executor, ExecutorError, ExecutorKind};

/// Errors that end a run before or outside normal task processing.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The graph failed validation.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An explicit resume was requested but the checkpoint is unreadable.
    #[error("cannot resume: {0}")]
    Resume(#[source] PersistenceError),

    /// The execution machinery failed; remaining work was abandoned.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Configuration for constructing a scheduler, usable from a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Which executor strategy to use.
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Worker budget for the pooled executors.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Where to persist checkpoints; `None` disables persistence.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

fn default_workers() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::default(),
            workers: default_workers(),
            checkpoint_path: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every task reached `Success`.
    Succeeded,
    /// At least one task failed or was skipped.
    Failed,
    /// The run was cancelled before completion.
    Aborted,
}

/// Final state of one task within a [`WorkflowReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// State the task ended the run in.
    pub state: TaskState,
    /// Attempts made (0 if the task never started).
    pub attempts: u32,
    /// Value produced by a succeeded task.
    pub result: Option<Value>,
    /// Last failure reason; for a skipped task this names the upstream cause.
    pub error: Option<String>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    /// The workflow that ran.
    pub workflow: WorkflowId,
    /// The run identifier.
    pub run: RunId,
    /// Overall outcome.
    pub outcome: RunOutcome,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Final per-task states, keyed by name.
    pub tasks: BTreeMap<TaskId, TaskReport>,
    /// True if a checkpoint save failed during the run. The run itself is
    /// unaffected; a later resume may see stale state.
    pub persistence_degraded: bool,
}

impl WorkflowReport {
    /// Get the names of tasks that failed terminally.
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, report)| report.state == TaskState::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Default, Clone)]
struct TaskRecord {
    state: TaskState,
    attempts: u32,
    last_error: Option<String>,
    result: Option<Value>,
}

enum LoopMsg {
    Finished {
        task: TaskId,
        started: Instant,
        outcome: Result<crate::executor::TaskOutcome, ExecutorError>,
    },
    RetryDue {
        task: TaskId,
    },
}

/// Drives one workflow run at a time.
pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    kind: ExecutorKind,
    workers: usize,
    custom_executor: Option<Arc<dyn Executor>>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn CheckpointStore>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler with defaults: thread-pool executor with 4
    /// workers, no checkpointing, a fresh event bus.
    pub fn new(graph: WorkflowGraph) -> Self {
        Self {
            graph: Arc::new(graph),
            kind: ExecutorKind::default(),
            workers: default_workers(),
            custom_executor: None,
            events: Arc::new(EventBus::new()),
            store: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a scheduler from a [`SchedulerConfig`].
    pub fn from_config(graph: WorkflowGraph, config: &SchedulerConfig) -> Self {
        let mut scheduler = Self::new(graph);
        scheduler.kind = config.executor;
        scheduler.workers = config.workers;
        if let Some(path) = &config.checkpoint_path {
            scheduler = scheduler.with_checkpoint_store(Arc::new(JsonCheckpointStore::new(path)));
        }
        scheduler
    }

    /// Builder: install a specific executor instance.
    ///
    /// The instance is used as-is; the kind and worker budget settings do
    /// not apply to it.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.custom_executor = Some(executor);
        self
    }

    /// Builder: set the worker budget for the pooled executors.
    ///
    /// Applied when the run builds its executor, so builder call order does
    /// not matter. An executor installed through
    /// [`with_executor`](Self::with_executor) keeps its own budget.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder: replace the event bus.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Builder: enable checkpointing through the given store.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder: use an external cancellation token to abort runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the event bus, for registering handlers.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Get the cancellation token that aborts a running workflow.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Get the workflow graph.
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Validate the graph and return the execution order without running
    /// anything. The dry-run surface.
    pub fn plan(&self) -> Result<Vec<TaskId>, SchedulerError> {
        self.graph.validate()?;
        Ok(self.graph.topological_order()?)
    }

    /// Run the workflow from scratch.
    pub async fn run(&self) -> Result<WorkflowReport, SchedulerError> {
        self.execute(None).await
    }

    /// Resume the workflow from the latest checkpoint.
    ///
    /// Succeeded tasks keep their state and results and are not re-executed.
    /// Failed and skipped tasks are reset to pending so the run can make
    /// progress; recorded attempt counts are preserved. With no checkpoint
    /// on record this behaves like [`run`](Self::run). An unreadable
    /// checkpoint is fatal here, unlike save failures during a run.
    pub async fn resume(&self) -> Result<WorkflowReport, SchedulerError> {
        let restored = match &self.store {
            Some(store) => store.load().await.map_err(SchedulerError::Resume)?,
            None => None,
        };
        self.execute(restored).await
    }

    async fn execute(&self, restored: Option<Checkpoint>) -> Result<WorkflowReport, SchedulerError> {
        self.graph.validate()?;

        let executor = match &self.custom_executor {
            Some(executor) => Arc::clone(executor),
            None => build_executor(self.kind, self.workers),
        };

        let run = restored.as_ref().map(|c| c.run).unwrap_or_default();
        let span = tracing::info_span!(
            "workflow_run",
            workflow = %self.graph.id(),
            run = %run,
            executor = ?executor.kind(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = RunLoop {
            graph: Arc::clone(&self.graph),
            executor,
            events: Arc::clone(&self.events),
            store: self.store.clone(),
            run,
            cancel: self.cancel.child_token(),
            records: restore_records(&self.graph, restored.as_ref()),
            in_flight: 0,
            pending_timers: 0,
            aborted: false,
            fatal: None,
            persistence_degraded: false,
            tx,
        };

        state.drive(rx).instrument(span).await
    }
}

/// Build the initial state table, applying a checkpoint if one was loaded.
fn restore_records(
    graph: &WorkflowGraph,
    restored: Option<&Checkpoint>,
) -> HashMap<TaskId, TaskRecord> {
    let mut records: HashMap<TaskId, TaskRecord> = graph
        .task_ids()
        .into_iter()
        .map(|id| (id, TaskRecord::default()))
        .collect();

    if let Some(checkpoint) = restored {
        for saved in &checkpoint.tasks {
            // Names absent from the graph are tolerated: the workflow
            // definition may have changed since the snapshot.
            let Some(record) = records.get_mut(&saved.name) else {
                continue;
            };
            record.attempts = saved.attempts;
            record.last_error = saved.last_error.clone();
            record.result = saved.result.clone();
            record.state = match saved.state {
                TaskState::Success => TaskState::Success,
                // Failed and Skipped get a fresh chance on resume; a resume
                // that replays the old failure verbatim would be pointless.
                _ => TaskState::Pending,
            };
        }
    }

    records
}

struct RunLoop {
    graph: Arc<WorkflowGraph>,
    executor: Arc<dyn Executor>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn CheckpointStore>>,
    run: RunId,
    cancel: CancellationToken,
    records: HashMap<TaskId, TaskRecord>,
    in_flight: usize,
    pending_timers: usize,
    aborted: bool,
    fatal: Option<ExecutorError>,
    persistence_degraded: bool,
    tx: mpsc::UnboundedSender<LoopMsg>,
}

impl RunLoop {
    async fn drive(
        mut self,
        mut rx: mpsc::UnboundedReceiver<LoopMsg>,
    ) -> Result<WorkflowReport, SchedulerError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        info!(tasks = self.graph.len(), "workflow run starting");
        self.events
            .emit(Event::workflow_started(self.graph.id().clone(), self.run))
            .await;

        loop {
            if !self.aborted && self.fatal.is_none() {
                self.dispatch_ready().await;
            }

            // Retry timers stop mattering once the run is being torn down.
            let timers_blocking = self.pending_timers > 0 && !self.aborted && self.fatal.is_none();
            if self.in_flight == 0 && !timers_blocking {
                break;
            }

            let already_aborted = self.aborted;
            tokio::select! {
                _ = cancel.cancelled(), if !already_aborted => {
                    warn!("run aborted; waiting for in-flight attempts to drain");
                    self.aborted = true;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => break,
                },
            }
        }

        self.finish(started.elapsed()).await
    }

    /// Start every ready task the worker budget allows.
    async fn dispatch_ready(&mut self) {
        loop {
            let budget = self.executor.concurrency();
            if self.in_flight >= budget {
                return;
            }

            let ready = self.graph.ready_set(&self.state_view());
            let mut launched = false;
            for task_id in ready {
                if self.in_flight >= self.executor.concurrency() {
                    break;
                }
                if self.aborted || self.fatal.is_some() {
                    return;
                }
                self.start_task(task_id).await;
                launched = true;
            }
            // Inline execution completes synchronously and may have
            // unlocked new tasks; loop until a full pass launches nothing.
            if !launched {
                return;
            }
        }
    }

    async fn start_task(&mut self, task_id: TaskId) {
        // The ready snapshot can go stale mid-pass when inline execution
        // fails a sibling and skips its dependents.
        if self
            .records
            .get(&task_id)
            .map(|r| r.state != TaskState::Pending)
            .unwrap_or(true)
        {
            return;
        }
        let Some(task) = self.graph.get_task(&task_id).cloned() else {
            return;
        };

        let attempt = {
            let record = self
                .records
                .entry(task_id.clone())
                .or_default();
            record.state = TaskState::Running;
            record.attempts += 1;
            record.attempts
        };

        debug!(task = %task_id, attempt, "dispatching task");
        self.events
            .emit(Event::task_started(task_id.clone(), self.run, attempt))
            .await;

        let ctx = WorkContext::new(attempt, self.cancel.clone());

        if self.executor.kind() == ExecutorKind::Inline {
            let started = Instant::now();
            let outcome = self.executor.run(task, ctx).await;
            self.on_finished(task_id, started, outcome).await;
        } else {
            self.in_flight += 1;
            let executor = Arc::clone(&self.executor);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = executor.run(task, ctx).await;
                let _ = tx.send(LoopMsg::Finished {
                    task: task_id,
                    started,
                    outcome,
                });
            });
        }
    }

    async fn on_message(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Finished {
                task,
                started,
                outcome,
            } => {
                self.in_flight -= 1;
                self.on_finished(task, started, outcome).await;
            }
            LoopMsg::RetryDue { task } => {
                self.pending_timers = self.pending_timers.saturating_sub(1);
                if self.aborted || self.fatal.is_some() {
                    return;
                }
                if let Some(record) = self.records.get_mut(&task) {
                    if record.state == TaskState::RetryWait {
                        debug!(task = %task, "retry delay elapsed");
                        record.state = TaskState::Pending;
                    }
                }
            }
        }
    }

    async fn on_finished(
        &mut self,
        task_id: TaskId,
        started: Instant,
        outcome: Result<crate::executor::TaskOutcome, ExecutorError>,
    ) {
        if self.aborted || self.fatal.is_some() {
            // Result of a cancelled attempt: discard it and leave the task
            // in its durable pre-attempt state.
            if let Some(record) = self.records.get_mut(&task_id) {
                record.state = TaskState::Pending;
            }
            return;
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(exec_err) => {
                warn!(task = %task_id, error = %exec_err, "executor unavailable; aborting run");
                self.fatal = Some(exec_err);
                self.cancel.cancel();
                if let Some(record) = self.records.get_mut(&task_id) {
                    record.state = TaskState::Pending;
                }
                return;
            }
        };

        let attempt = self
            .records
            .get(&task_id)
            .map(|r| r.attempts)
            .unwrap_or(1);

        match outcome {
            Ok(value) => {
                debug!(task = %task_id, attempt, "task succeeded");
                if let Some(record) = self.records.get_mut(&task_id) {
                    record.state = TaskState::Success;
                    record.result = Some(value);
                    record.last_error = None;
                }
                self.events
                    .emit(Event::task_succeeded(
                        task_id,
                        self.run,
                        attempt,
                        started.elapsed(),
                    ))
                    .await;
            }
            Err(task_err) => {
                let policy = self
                    .graph
                    .get_task(&task_id)
                    .map(|t| t.retry_policy())
                    .unwrap_or_default();

                match policy.decide(attempt, &task_err) {
                    RetryDecision::Retry(delay) => {
                        debug!(task = %task_id, attempt, ?delay, error = %task_err, "scheduling retry");
                        if let Some(record) = self.records.get_mut(&task_id) {
                            record.state = TaskState::RetryWait;
                            record.last_error = Some(task_err.to_string());
                        }
                        self.events
                            .emit(Event::task_retrying(
                                task_id.clone(),
                                self.run,
                                attempt,
                                delay,
                                task_err.to_string(),
                            ))
                            .await;
                        self.pending_timers += 1;
                        let tx = self.tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(LoopMsg::RetryDue { task: task_id });
                        });
                    }
                    RetryDecision::GiveUp => {
                        warn!(task = %task_id, attempt, error = %task_err, "task failed terminally");
                        if let Some(record) = self.records.get_mut(&task_id) {
                            record.state = TaskState::Failed;
                            record.last_error = Some(task_err.to_string());
                        }
                        self.events
                            .emit(Event::task_failed(
                                task_id.clone(),
                                self.run,
                                attempt,
                                task_err.to_string(),
                            ))
                            .await;
                        self.skip_downstream(&task_id).await;
                    }
                }
            }
        }

        self.write_checkpoint().await;
    }

    /// Mark every not-yet-started transitive dependent of a terminally
    /// failed task as skipped.
    async fn skip_downstream(&mut self, failed: &TaskId) {
        for dependent in self.graph.transitive_dependents(failed) {
            let Some(record) = self.records.get_mut(&dependent) else {
                continue;
            };
            if record.state != TaskState::Pending {
                continue;
            }
            record.state = TaskState::Skipped;
            record.last_error = Some(format!("upstream task '{}' failed", failed));
            debug!(task = %dependent, cause = %failed, "task skipped");
            self.events
                .emit(Event::task_skipped(dependent, self.run, failed.clone()))
                .await;
        }
    }

    /// Persist the current state table. Best effort: a failed save degrades
    /// the report but never the run.
    async fn write_checkpoint(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        let tasks = self
            .graph
            .task_ids()
            .into_iter()
            .filter_map(|id| {
                self.records.get(&id).map(|record| {
                    TaskCheckpoint::durable(
                        id.clone(),
                        record.state,
                        record.attempts,
                        record.last_error.clone(),
                        record.result.clone(),
                    )
                })
            })
            .collect();
        let checkpoint = Checkpoint::new(self.graph.id().clone(), self.run, tasks);

        if let Err(err) = store.save(&checkpoint).await {
            warn!(error = %err, "checkpoint save failed; continuing without persistence");
            self.persistence_degraded = true;
        }
    }

    fn state_view(&self) -> HashMap<TaskId, TaskState> {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.state))
            .collect()
    }

    async fn finish(mut self, duration: Duration) -> Result<WorkflowReport, SchedulerError> {
        self.write_checkpoint().await;

        let workflow = self.graph.id().clone();
        let all_succeeded = self
            .records
            .values()
            .all(|record| record.state == TaskState::Success);
        let failed: Vec<TaskId> = {
            let mut failed: Vec<TaskId> = self
                .records
                .iter()
                .filter(|(_, record)| record.state == TaskState::Failed)
                .map(|(id, _)| id.clone())
                .collect();
            failed.sort();
            failed
        };

        let outcome = if self.fatal.is_some() || self.aborted {
            RunOutcome::Aborted
        } else if all_succeeded {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };

        match outcome {
            RunOutcome::Succeeded => {
                info!(?duration, "workflow run succeeded");
                self.events
                    .emit(Event::workflow_succeeded(workflow.clone(), self.run, duration))
                    .await;
            }
            RunOutcome::Failed | RunOutcome::Aborted => {
                warn!(?duration, ?outcome, failed = failed.len(), "workflow run did not succeed");
                self.events
                    .emit(Event::workflow_failed(
                        workflow.clone(),
                        self.run,
                        duration,
                        failed,
                    ))
                    .await;
            }
        }

        if let Some(fatal) = self.fatal {
            return Err(fatal.into());
        }

        let tasks = self
            .records
            .into_iter()
            .map(|(id, record)| {
                (
                    id,
                    TaskReport {
                        state: record.state,
                        attempts: record.attempts,
                        result: record.result,
                        error: record.last_error,
                    },
                )
            })
            .collect();

        Ok(WorkflowReport {
            workflow,
            run: self.run,
            outcome,
            duration,
            tasks,
            persistence_degraded: self.persistence_degraded,
        })
    }
}
