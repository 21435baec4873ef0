//! Retry behavior under flaky and terminally failing tasks.

use flowforge::testing::{FailNTimesTask, NamedFnTask, RecordingHandler};
use flowforge::{
    EventKind, GraphBuilder, RetryPolicy, RunOutcome, Scheduler, TaskError, TaskId, TaskState,
};
use std::time::Duration;

#[tokio::test]
async fn test_etl_transform_recovers_after_two_failures() {
    crate::common::init_tracing();
    let extract = FailNTimesTask::new("extract", 0, RetryPolicy::none());
    let transform = FailNTimesTask::new(
        "transform",
        2,
        RetryPolicy::fixed(2, Duration::from_millis(5)),
    );
    let load = FailNTimesTask::new("load", 0, RetryPolicy::none());

    let graph = GraphBuilder::new("etl", "ETL")
        .add_task(extract.clone())
        .add_task_with_deps(transform.clone(), &["extract"])
        .add_task_with_deps(load.clone(), &["transform"])
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph);
    let handler = RecordingHandler::new();
    scheduler.events().register(handler.clone()).await;

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(extract.invocations(), 1);
    assert_eq!(transform.invocations(), 3);
    assert_eq!(load.invocations(), 1);
    assert_eq!(report.tasks[&TaskId::new("transform")].attempts, 3);
    assert_eq!(handler.count_of(EventKind::TaskRetrying).await, 2);
}

#[tokio::test]
async fn test_retries_stop_at_budget_and_downstream_skips() {
    let doomed = FailNTimesTask::new(
        "doomed",
        u32::MAX,
        RetryPolicy::fixed(2, Duration::from_millis(1)),
    );
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(doomed.clone())
        .add_task_with_deps(
            FailNTimesTask::arc("after", 0, RetryPolicy::none()),
            &["doomed"],
        )
        .build()
        .unwrap();

    let report = Scheduler::new(graph).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    // 1 initial + 2 retries.
    assert_eq!(doomed.invocations(), 3);
    assert_eq!(report.tasks[&TaskId::new("doomed")].state, TaskState::Failed);
    assert_eq!(report.tasks[&TaskId::new("after")].state, TaskState::Skipped);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(NamedFnTask::arc("misconfigured", |_ctx| {
            Err(TaskError::Validation("required input missing".to_string()))
        }))
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph);
    let handler = RecordingHandler::new();
    scheduler.events().register(handler.clone()).await;

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    let task = &report.tasks[&TaskId::new("misconfigured")];
    assert_eq!(task.state, TaskState::Failed);
    // Generous retry budget, but validation failures are terminal at once.
    assert_eq!(task.attempts, 1);
    assert_eq!(handler.count_of(EventKind::TaskRetrying).await, 0);
}

#[tokio::test]
async fn test_retrying_task_does_not_block_siblings() {
    let flaky = FailNTimesTask::new(
        "flaky",
        1,
        RetryPolicy::fixed(1, Duration::from_millis(50)),
    );
    let steady = FailNTimesTask::new("steady", 0, RetryPolicy::none());

    let graph = GraphBuilder::new("wf", "WF")
        .add_task(flaky.clone())
        .add_task(steady.clone())
        .build()
        .unwrap();

    let report = Scheduler::new(graph).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(flaky.invocations(), 2);
    assert_eq!(steady.invocations(), 1);
}

#[tokio::test]
async fn test_retry_failure_message_is_reported() {
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(NamedFnTask::arc("broken", |_ctx| {
            Err::<serde_json::Value, _>(TaskError::ExecutionFailed(
                "connection refused".to_string(),
            ))
        }))
        .build()
        .unwrap();

    let report = Scheduler::new(graph).run().await.unwrap();

    let error = report.tasks[&TaskId::new("broken")]
        .error
        .as_deref()
        .unwrap();
    assert!(error.contains("connection refused"));
    assert_eq!(report.tasks[&TaskId::new("broken")].result, None);
}
