//! Checkpointing and resume tests.

use async_trait::async_trait;
use flowforge::testing::{FailNTimesTask, ValueTask};
use flowforge::{
    Checkpoint, CheckpointStore, GraphBuilder, JsonCheckpointStore, PersistenceError,
    RetryPolicy, RunOutcome, Scheduler, TaskId, TaskState,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_checkpoint_reflects_final_run_state() {
    crate::common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");

    let graph = GraphBuilder::new("etl", "ETL")
        .add_task(ValueTask::arc("extract", json!({"rows": 10})))
        .add_task_with_deps(
            FailNTimesTask::arc("transform", u32::MAX, RetryPolicy::none()),
            &["extract"],
        )
        .add_task_with_deps(ValueTask::arc("load", json!(null)), &["transform"])
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph)
        .with_checkpoint_store(Arc::new(JsonCheckpointStore::new(&path)));
    let report = scheduler.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed);

    let store = JsonCheckpointStore::new(&path);
    let checkpoint = store.load().await.unwrap().expect("checkpoint written");

    let extract = checkpoint.task(&TaskId::new("extract")).unwrap();
    assert_eq!(extract.state, TaskState::Success);
    assert_eq!(extract.result, Some(json!({"rows": 10})));
    assert_eq!(extract.attempts, 1);

    let transform = checkpoint.task(&TaskId::new("transform")).unwrap();
    assert_eq!(transform.state, TaskState::Failed);
    assert!(transform.last_error.is_some());

    let load = checkpoint.task(&TaskId::new("load")).unwrap();
    assert_eq!(load.state, TaskState::Skipped);

    // In-flight states are never durable.
    for task in &checkpoint.tasks {
        assert_ne!(task.state, TaskState::Running);
        assert_ne!(task.state, TaskState::RetryWait);
    }
}

#[tokio::test]
async fn test_resume_skips_succeeded_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonCheckpointStore::new(dir.path().join("run.json")));

    let extract = FailNTimesTask::new("extract", 0, RetryPolicy::none());
    // Fails once; with no retry budget the first run ends Failed.
    let load = FailNTimesTask::new("load", 1, RetryPolicy::none());

    let graph = GraphBuilder::new("etl", "ETL")
        .add_task(extract.clone())
        .add_task_with_deps(load.clone(), &["extract"])
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph).with_checkpoint_store(store.clone());

    let first = scheduler.run().await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Failed);
    assert_eq!(extract.invocations(), 1);
    assert_eq!(load.invocations(), 1);

    let second = scheduler.resume().await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Succeeded);
    // extract was already succeeded in the checkpoint: not re-executed.
    assert_eq!(extract.invocations(), 1);
    // load got a fresh chance and succeeded.
    assert_eq!(load.invocations(), 2);
    assert_eq!(second.tasks[&TaskId::new("extract")].state, TaskState::Success);
    assert_eq!(second.tasks[&TaskId::new("load")].state, TaskState::Success);
}

#[tokio::test]
async fn test_resume_is_idempotent_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonCheckpointStore::new(dir.path().join("run.json")));

    let only = FailNTimesTask::new("only", 0, RetryPolicy::none());
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(only.clone())
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph).with_checkpoint_store(store);

    assert_eq!(scheduler.run().await.unwrap().outcome, RunOutcome::Succeeded);
    assert_eq!(scheduler.resume().await.unwrap().outcome, RunOutcome::Succeeded);
    assert_eq!(scheduler.resume().await.unwrap().outcome, RunOutcome::Succeeded);

    // Only the original run executed the body.
    assert_eq!(only.invocations(), 1);
}

#[tokio::test]
async fn test_resume_without_checkpoint_runs_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonCheckpointStore::new(dir.path().join("never.json")));

    let graph = GraphBuilder::new("wf", "WF")
        .add_task(ValueTask::arc("a", json!(1)))
        .build()
        .unwrap();

    let report = Scheduler::new(graph)
        .with_checkpoint_store(store)
        .resume()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn test_resume_preserves_run_id_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonCheckpointStore::new(dir.path().join("run.json")));

    let graph = GraphBuilder::new("wf", "WF")
        .add_task(FailNTimesTask::arc("flappy", 1, RetryPolicy::none()))
        .build()
        .unwrap();

    let scheduler = Scheduler::new(graph).with_checkpoint_store(store.clone());

    let first = scheduler.run().await.unwrap();
    let second = scheduler.resume().await.unwrap();

    assert_eq!(first.run, second.run);
}

struct BrokenStore;

#[async_trait]
impl CheckpointStore for BrokenStore {
    async fn save(&self, _checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        Err(PersistenceError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "disk on fire",
        )))
    }

    async fn load(&self) -> Result<Option<Checkpoint>, PersistenceError> {
        Err(PersistenceError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "disk on fire",
        )))
    }
}

#[tokio::test]
async fn test_save_failures_degrade_but_do_not_abort() {
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(ValueTask::arc("a", json!(1)))
        .build()
        .unwrap();

    let report = Scheduler::new(graph)
        .with_checkpoint_store(Arc::new(BrokenStore))
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert!(report.persistence_degraded);
}

#[tokio::test]
async fn test_unreadable_checkpoint_fails_explicit_resume() {
    let graph = GraphBuilder::new("wf", "WF")
        .add_task(ValueTask::arc("a", json!(1)))
        .build()
        .unwrap();

    let result = Scheduler::new(graph)
        .with_checkpoint_store(Arc::new(BrokenStore))
        .resume()
        .await;

    assert!(matches!(
        result,
        Err(flowforge::SchedulerError::Resume(_))
    ));
}
