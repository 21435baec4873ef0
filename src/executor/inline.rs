//! Inline executor: run bodies directly on the caller's task.

use async_trait::async_trait;
use std::sync::Arc;

use super::{invoke_scoped, Executor, ExecutorError, TaskOutcome};
use crate::core::task::{Task, WorkContext};

/// Executor that awaits each body in place, one attempt at a time.
///
/// Nothing is spawned, so execution order is fully determined by the
/// scheduler's draw order. A panicking body propagates to the caller; this
/// executor offers no isolation by construction.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl InlineExecutor {
    /// Create a new inline executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        ctx: WorkContext,
    ) -> Result<TaskOutcome, ExecutorError> {
        Ok(invoke_scoped(&task, &ctx).await)
    }

    fn kind(&self) -> super::ExecutorKind {
        super::ExecutorKind::Inline
    }

    fn concurrency(&self) -> usize {
        1
    }
}
