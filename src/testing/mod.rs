//! Reusable task and handler fixtures for tests.
//!
//! These are shipped as a public module so integration tests and downstream
//! crates can build workflows without boilerplate task impls.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskError, WorkContext};
use crate::events::{Event, EventHandler, EventKind};

/// A task that always succeeds with a fixed value.
pub struct ValueTask {
    name: String,
    value: Value,
}

impl ValueTask {
    /// Create a value task.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Create a value task behind an `Arc<dyn Task>`.
    pub fn arc(name: impl Into<String>, value: Value) -> Arc<dyn Task> {
        Arc::new(Self::new(name, value))
    }
}

#[async_trait]
impl Task for ValueTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _ctx: &WorkContext) -> Result<Value, TaskError> {
        Ok(self.value.clone())
    }
}

/// A task that fails its first `failures` invocations, then succeeds.
///
/// The invocation counter is shared, so a cloned handle can observe how
/// many times the scheduler actually ran the body.
pub struct FailNTimesTask {
    name: String,
    failures: u32,
    invocations: AtomicU32,
    policy: RetryPolicy,
}

impl FailNTimesTask {
    /// Create the task behind an `Arc` so callers can keep a handle for
    /// inspecting the invocation count.
    pub fn new(name: impl Into<String>, failures: u32, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            failures,
            invocations: AtomicU32::new(0),
            policy,
        })
    }

    /// Create the task directly as an `Arc<dyn Task>`.
    pub fn arc(name: impl Into<String>, failures: u32, policy: RetryPolicy) -> Arc<dyn Task> {
        Self::new(name, failures, policy)
    }

    /// How many times the body has run.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for FailNTimesTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _ctx: &WorkContext) -> Result<Value, TaskError> {
        let so_far = self.invocations.fetch_add(1, Ordering::SeqCst);
        if so_far < self.failures {
            Err(TaskError::ExecutionFailed(format!(
                "induced failure {} of {}",
                so_far + 1,
                self.failures
            )))
        } else {
            Ok(Value::String(format!("succeeded on attempt {}", so_far + 1)))
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }
}

/// A task wrapping a plain closure.
pub struct NamedFnTask<F> {
    name: String,
    body: F,
}

impl<F> NamedFnTask<F>
where
    F: Fn(&WorkContext) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    /// Create a closure-backed task.
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Create a closure-backed task behind an `Arc<dyn Task>`.
    pub fn arc(name: impl Into<String>, body: F) -> Arc<dyn Task> {
        Arc::new(Self::new(name, body))
    }
}

#[async_trait]
impl<F> Task for NamedFnTask<F>
where
    F: Fn(&WorkContext) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &WorkContext) -> Result<Value, TaskError> {
        (self.body)(ctx)
    }
}

/// Event handler that records everything it sees.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded events, in arrival order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// The kinds of recorded events, in arrival order.
    pub async fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().await.iter().map(Event::kind).collect()
    }

    /// How many events of the given kind were recorded.
    pub async fn count_of(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
