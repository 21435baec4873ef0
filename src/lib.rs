pub mod checkpoint;
pub mod core;
pub mod events;
pub mod executor;
pub mod scheduler;
pub mod testing;

pub use checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore, MemoryCheckpointStore, PersistenceError, TaskCheckpoint};
pub use crate::core::graph::{GraphBuilder, GraphError, WorkflowGraph};
pub use crate::core::resource::ResourceHook;
pub use crate::core::retry::{RetryDecision, RetryPolicy};
pub use crate::core::task::{CommandSpec, Task, TaskError, TaskState, WorkContext};
pub use crate::core::types::{RunId, TaskId, WorkflowId};
pub use events::{Event, EventBus, EventHandler, EventKind};
pub use executor::{
    build_executor, CommandTask, Executor, ExecutorError, ExecutorKind, InlineExecutor,
    ProcessPoolExecutor, TaskOutcome, ThreadPoolExecutor,
};
pub use scheduler::{
    RunOutcome, Scheduler, SchedulerConfig, SchedulerError, TaskReport, WorkflowReport,
};
