//! Common test utilities shared across integration tests.

use flowforge::testing::NamedFnTask;
use flowforge::{Task, TaskError};
use serde_json::json;
use std::sync::{Arc, Mutex, Once};

static TRACING: Once = Once::new();

/// Install a log subscriber once per test binary.
///
/// Verbosity follows `RUST_LOG`; output is captured per test by the
/// harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Shared log of task completion order.
pub type OrderLog = Arc<Mutex<Vec<String>>>;

/// Create an empty order log.
pub fn order_log() -> OrderLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A task that appends its name to the log when it runs, then succeeds.
pub fn ordered_task(name: &str, log: &OrderLog) -> Arc<dyn Task> {
    let log = Arc::clone(log);
    let task_name = name.to_string();
    NamedFnTask::arc(name, move |_ctx| {
        log.lock().unwrap().push(task_name.clone());
        Ok(json!(null))
    })
}

/// A task that always fails with an execution error.
pub fn failing_task(name: &str) -> Arc<dyn Task> {
    let message = format!("{} blew up", name);
    NamedFnTask::arc(name, move |_ctx| -> Result<serde_json::Value, TaskError> {
        Err(TaskError::ExecutionFailed(message.clone()))
    })
}

/// Position of a task name in the log. Panics if the task never ran.
pub fn position(log: &OrderLog, name: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .position(|entry| entry == name)
        .unwrap_or_else(|| panic!("task '{}' never ran", name))
}
