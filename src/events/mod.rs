//! Lifecycle events and event handling.
//!
//! The scheduler emits an [`Event`] at every observable transition of a run.
//! Handlers subscribe through the [`EventBus`]; each delivery happens on its
//! own spawned task, so a panicking handler is contained and logged rather
//! than taking down the run. Deliveries are awaited in registration order,
//! so handlers are expected to return promptly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::{RunId, TaskId, WorkflowId};

/// Coarse classification of an [`Event`], used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkflowStarted,
    WorkflowSucceeded,
    WorkflowFailed,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskRetrying,
    TaskSkipped,
}

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started.
    WorkflowStarted {
        workflow: WorkflowId,
        run: RunId,
        timestamp: DateTime<Utc>,
    },

    /// Every task in the run reached `Success`.
    WorkflowSucceeded {
        workflow: WorkflowId,
        run: RunId,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// The run finished with at least one failed or skipped task.
    WorkflowFailed {
        workflow: WorkflowId,
        run: RunId,
        duration: Duration,
        failed: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },

    /// An attempt of a task was dispatched to the executor.
    TaskStarted {
        task: TaskId,
        run: RunId,
        /// 1-indexed; 2 and above indicate a retry attempt.
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A task completed and returned a value.
    TaskSucceeded {
        task: TaskId,
        run: RunId,
        attempt: u32,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// A task failed terminally; retries (if any) are exhausted.
    TaskFailed {
        task: TaskId,
        run: RunId,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// An attempt failed and a retry is scheduled.
    ///
    /// Emitted before the delay begins, so consumers observe retries in
    /// real time.
    TaskRetrying {
        task: TaskId,
        run: RunId,
        /// The attempt number that just failed (1-indexed).
        attempt: u32,
        delay: Duration,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A task will never run because an upstream task failed or was skipped.
    TaskSkipped {
        task: TaskId,
        run: RunId,
        /// The terminally failed task this skip traces back to.
        cause: TaskId,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::WorkflowStarted { timestamp, .. } => *timestamp,
            Event::WorkflowSucceeded { timestamp, .. } => *timestamp,
            Event::WorkflowFailed { timestamp, .. } => *timestamp,
            Event::TaskStarted { timestamp, .. } => *timestamp,
            Event::TaskSucceeded { timestamp, .. } => *timestamp,
            Event::TaskFailed { timestamp, .. } => *timestamp,
            Event::TaskRetrying { timestamp, .. } => *timestamp,
            Event::TaskSkipped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the kind of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Event::WorkflowSucceeded { .. } => EventKind::WorkflowSucceeded,
            Event::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Event::TaskStarted { .. } => EventKind::TaskStarted,
            Event::TaskSucceeded { .. } => EventKind::TaskSucceeded,
            Event::TaskFailed { .. } => EventKind::TaskFailed,
            Event::TaskRetrying { .. } => EventKind::TaskRetrying,
            Event::TaskSkipped { .. } => EventKind::TaskSkipped,
        }
    }

    /// Create a WorkflowStarted event.
    pub fn workflow_started(workflow: WorkflowId, run: RunId) -> Self {
        Event::WorkflowStarted {
            workflow,
            run,
            timestamp: Utc::now(),
        }
    }

    /// Create a WorkflowSucceeded event.
    pub fn workflow_succeeded(workflow: WorkflowId, run: RunId, duration: Duration) -> Self {
        Event::WorkflowSucceeded {
            workflow,
            run,
            duration,
            timestamp: Utc::now(),
        }
    }

    /// Create a WorkflowFailed event.
    pub fn workflow_failed(
        workflow: WorkflowId,
        run: RunId,
        duration: Duration,
        failed: Vec<TaskId>,
    ) -> Self {
        Event::WorkflowFailed {
            workflow,
            run,
            duration,
            failed,
            timestamp: Utc::now(),
        }
    }

    /// Create a TaskStarted event.
    pub fn task_started(task: TaskId, run: RunId, attempt: u32) -> Self {
        Event::TaskStarted {
            task,
            run,
            attempt,
            timestamp: Utc::now(),
        }
    }

    /// Create a TaskSucceeded event.
    pub fn task_succeeded(task: TaskId, run: RunId, attempt: u32, duration: Duration) -> Self {
        Event::TaskSucceeded {
            task,
            run,
            attempt,
            duration,
            timestamp: Utc::now(),
        }
    }

    /// Create a TaskFailed event.
    pub fn task_failed(task: TaskId, run: RunId, attempt: u32, error: String) -> Self {
        Event::TaskFailed {
            task,
            run,
            attempt,
            error,
            timestamp: Utc::now(),
        }
    }

    /// Create a TaskRetrying event.
    pub fn task_retrying(
        task: TaskId,
        run: RunId,
        attempt: u32,
        delay: Duration,
        error: String,
    ) -> Self {
        Event::TaskRetrying {
            task,
            run,
            attempt,
            delay,
            error,
            timestamp: Utc::now(),
        }
    }

    /// Create a TaskSkipped event.
    pub fn task_skipped(task: TaskId, run: RunId, cause: TaskId) -> Self {
        Event::TaskSkipped {
            task,
            run,
            cause,
            timestamp: Utc::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

struct Subscription {
    /// `None` subscribes to every event.
    kinds: Option<HashSet<EventKind>>,
    handler: Arc<dyn EventHandler>,
}

/// Event bus for distributing events to registered handlers.
///
/// Delivery is sequential per emit call, but each handler runs on its own
/// spawned task so a panic inside one handler is contained and logged rather
/// than propagated into the scheduler.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for all events.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscriptions.write().await;
        subs.push(Subscription {
            kinds: None,
            handler,
        });
    }

    /// Register a handler for the given event kinds only.
    pub async fn register_for(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscriptions.write().await;
        subs.push(Subscription {
            kinds: Some(kinds.iter().copied().collect()),
            handler,
        });
    }

    /// Emit an event to all interested handlers.
    ///
    /// Returns once every handler has finished (or panicked). Handler panics
    /// are logged and swallowed.
    pub async fn emit(&self, event: Event) {
        let subs = self.subscriptions.read().await;
        let kind = event.kind();
        for sub in subs.iter() {
            if let Some(kinds) = &sub.kinds {
                if !kinds.contains(&kind) {
                    continue;
                }
            }
            let handler = Arc::clone(&sub.handler);
            let event = event.clone();
            let outcome = tokio::spawn(async move {
                handler.handle(&event).await;
            })
            .await;
            if let Err(join_err) = outcome {
                tracing::warn!(kind = ?kind, error = %join_err, "event handler panicked");
            }
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
