//! Executor strategy tests: equivalence, process isolation, cancellation.

use async_trait::async_trait;
use flowforge::testing::FailNTimesTask;
use flowforge::{
    CommandTask, GraphBuilder, InlineExecutor, ProcessPoolExecutor, RetryPolicy, RunOutcome,
    Scheduler, Task, TaskError, TaskId, TaskState, ThreadPoolExecutor, WorkContext,
    WorkflowGraph,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A deterministic graph with a flaky middle task; fresh tasks per call.
fn deterministic_graph() -> WorkflowGraph {
    GraphBuilder::new("wf", "WF")
        .add_task(FailNTimesTask::arc("a", 0, RetryPolicy::none()))
        .add_task_with_deps(
            FailNTimesTask::arc("flaky", 2, RetryPolicy::fixed(3, Duration::from_millis(1))),
            &["a"],
        )
        .add_task_with_deps(
            FailNTimesTask::arc("doomed", u32::MAX, RetryPolicy::none()),
            &["a"],
        )
        .add_task_with_deps(FailNTimesTask::arc("join", 0, RetryPolicy::none()), &["flaky", "doomed"])
        .build()
        .unwrap()
}

fn final_states(report: &flowforge::WorkflowReport) -> BTreeMap<TaskId, TaskState> {
    report
        .tasks
        .iter()
        .map(|(id, task)| (id.clone(), task.state))
        .collect()
}

#[tokio::test]
async fn test_inline_and_thread_pool_agree_on_final_states() {
    let inline_report = Scheduler::new(deterministic_graph())
        .with_executor(Arc::new(InlineExecutor::new()))
        .run()
        .await
        .unwrap();

    let pool_report = Scheduler::new(deterministic_graph())
        .with_executor(Arc::new(ThreadPoolExecutor::new(4)))
        .run()
        .await
        .unwrap();

    assert_eq!(inline_report.outcome, pool_report.outcome);
    assert_eq!(final_states(&inline_report), final_states(&pool_report));
    // Shape check: the flaky task recovered, the doomed one took down the join.
    assert_eq!(
        inline_report.tasks[&TaskId::new("flaky")].state,
        TaskState::Success
    );
    assert_eq!(
        inline_report.tasks[&TaskId::new("join")].state,
        TaskState::Skipped
    );
}

fn command_graph() -> WorkflowGraph {
    GraphBuilder::new("cmd", "Commands")
        .add_task(Arc::new(
            CommandTask::builder("echo").name("emit").arg(r#"{"n": 1}"#).build(),
        ))
        .add_task_with_deps(
            Arc::new(CommandTask::builder("true").name("check").build()),
            &["emit"],
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_process_pool_runs_command_workflow() {
    let report = Scheduler::new(command_graph())
        .with_executor(Arc::new(ProcessPoolExecutor::new(2)))
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.tasks[&TaskId::new("emit")].result, Some(json!({"n": 1})));
}

#[tokio::test]
async fn test_command_tasks_agree_across_pool_kinds() {
    let process_report = Scheduler::new(command_graph())
        .with_executor(Arc::new(ProcessPoolExecutor::new(2)))
        .run()
        .await
        .unwrap();

    let thread_report = Scheduler::new(command_graph())
        .with_executor(Arc::new(ThreadPoolExecutor::new(2)))
        .run()
        .await
        .unwrap();

    assert_eq!(process_report.outcome, thread_report.outcome);
    assert_eq!(final_states(&process_report), final_states(&thread_report));
    assert_eq!(
        process_report.tasks[&TaskId::new("emit")].result,
        thread_report.tasks[&TaskId::new("emit")].result,
    );
}

#[tokio::test]
async fn test_failing_command_skips_downstream() {
    let graph = GraphBuilder::new("cmd", "Commands")
        .add_task(Arc::new(
            CommandTask::builder("sh")
                .name("broken")
                .args(["-c", "echo bad >&2; exit 7"])
                .build(),
        ))
        .add_task_with_deps(
            Arc::new(CommandTask::builder("true").name("after").build()),
            &["broken"],
        )
        .build()
        .unwrap();

    let report = Scheduler::new(graph)
        .with_executor(Arc::new(ProcessPoolExecutor::new(2)))
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    let broken = &report.tasks[&TaskId::new("broken")];
    assert_eq!(broken.state, TaskState::Failed);
    assert!(broken.error.as_deref().unwrap().contains("exit code 7"));
    assert_eq!(report.tasks[&TaskId::new("after")].state, TaskState::Skipped);
}

#[tokio::test]
async fn test_closure_task_fails_validation_on_process_pool() {
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(FailNTimesTask::arc("in_memory_only", 0, RetryPolicy::none()))
        .build()
        .unwrap();

    let report = Scheduler::new(graph)
        .with_executor(Arc::new(ProcessPoolExecutor::new(2)))
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    let task = &report.tasks[&TaskId::new("in_memory_only")];
    assert_eq!(task.state, TaskState::Failed);
    // Validation failure: terminal on the first attempt.
    assert_eq!(task.attempts, 1);
}

struct SleepingTask {
    name: String,
    duration: Duration,
}

#[async_trait]
impl Task for SleepingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _ctx: &WorkContext) -> Result<Value, TaskError> {
        tokio::time::sleep(self.duration).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_cancellation_aborts_the_run() {
    crate::common::init_tracing();
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(Arc::new(SleepingTask {
            name: "long".to_string(),
            duration: Duration::from_secs(60),
        }))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(graph).with_cancellation(cancel.clone());

    let run = tokio::spawn(async move { scheduler.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    // The interrupted task did not reach a terminal state.
    assert_eq!(report.tasks[&TaskId::new("long")].state, TaskState::Pending);
}

#[tokio::test]
async fn test_cancellation_kills_child_processes_promptly() {
    let graph = GraphBuilder::new("cmd", "Commands")
        .add_task(Arc::new(
            CommandTask::builder("sleep").name("long").arg("60").build(),
        ))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(graph)
        .with_executor(Arc::new(ProcessPoolExecutor::new(1)))
        .with_cancellation(cancel.clone());

    let run = tokio::spawn(async move { scheduler.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    cancel.cancel();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(started.elapsed() < Duration::from_secs(5));
}
