//! Run state persistence.
//!
//! A [`Checkpoint`] is a durable snapshot of one run: for every task, its
//! state, attempt count, last error, and result. The scheduler writes one
//! after every state transition and can rebuild a run from the latest one,
//! skipping tasks that already succeeded.
//!
//! In-flight states are not durable. A task observed as `Running` or
//! `RetryWait` is recorded as `Pending` (attempts preserved), so a snapshot
//! never claims work that a crashed engine cannot vouch for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::task::TaskState;
use crate::core::types::{RunId, TaskId, WorkflowId};

pub mod json;
pub mod memory;

pub use json::JsonCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Errors from reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem problem while reading or writing.
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    /// The checkpoint could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable record of one task within a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    /// Task name.
    pub name: TaskId,
    /// State at snapshot time, downgraded to a durable state.
    pub state: TaskState,
    /// Attempts made so far (1-indexed; 0 if never started).
    #[serde(default)]
    pub attempts: u32,
    /// Message of the most recent failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// The value a succeeded task produced.
    #[serde(default)]
    pub result: Option<Value>,
}

impl TaskCheckpoint {
    /// Create a record, downgrading in-flight states to `Pending`.
    ///
    /// `Running` and `RetryWait` describe work the engine cannot vouch for
    /// after a restart; only terminal states and `Pending` are written.
    pub fn durable(
        name: TaskId,
        state: TaskState,
        attempts: u32,
        last_error: Option<String>,
        result: Option<Value>,
    ) -> Self {
        let state = match state {
            TaskState::Running | TaskState::RetryWait => TaskState::Pending,
            other => other,
        };
        Self {
            name,
            state,
            attempts,
            last_error,
            result,
        }
    }
}

/// Durable snapshot of one run.
///
/// Unknown fields are ignored on load, so older engines can read snapshots
/// written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The workflow this run belongs to.
    pub workflow: WorkflowId,
    /// The run being snapshotted.
    pub run: RunId,
    /// When the snapshot was taken.
    pub recorded_at: DateTime<Utc>,
    /// Per-task records.
    pub tasks: Vec<TaskCheckpoint>,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(workflow: WorkflowId, run: RunId, tasks: Vec<TaskCheckpoint>) -> Self {
        Self {
            workflow,
            run,
            recorded_at: Utc::now(),
            tasks,
        }
    }

    /// Look up the record for a task by name.
    pub fn task(&self, name: &TaskId) -> Option<&TaskCheckpoint> {
        self.tasks.iter().find(|t| &t.name == name)
    }
}

/// Storage backend for checkpoints.
///
/// A store holds at most one checkpoint; each save replaces the previous
/// snapshot of the run.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    /// Load the latest snapshot, or `None` if nothing was ever saved.
    async fn load(&self) -> Result<Option<Checkpoint>, PersistenceError>;
}
