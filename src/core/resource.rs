//! Scoped resource acquisition around task bodies.
//!
//! A [`ResourceHook`] pairs an acquire step with a release step. Executors
//! acquire every hook a task declares before invoking its body and release
//! them afterwards on every exit path: success, failure, timeout, and
//! cancellation. Release order is the reverse of acquisition order.

use async_trait::async_trait;
use std::sync::Arc;

use super::task::TaskError;

/// A resource acquired for the duration of one task attempt.
///
/// Typical implementations open a file or connection in `acquire` and close
/// it in `release`. `release` is infallible by contract; implementations
/// should log their own cleanup problems rather than surface them, since the
/// attempt's real outcome must not be masked by teardown.
#[async_trait]
pub trait ResourceHook: Send + Sync {
    /// Acquire the resource. A failure here fails the attempt with a
    /// validation error (the body never ran).
    async fn acquire(&self) -> Result<(), TaskError>;

    /// Release the resource. Called exactly once per successful acquire.
    async fn release(&self);
}

/// Tracks which hooks have been acquired so far, so a mid-sequence acquire
/// failure releases only what was actually taken.
pub(crate) struct ResourceScope {
    acquired: Vec<Arc<dyn ResourceHook>>,
}

impl ResourceScope {
    /// Acquire all hooks in order. On failure, releases the hooks acquired
    /// so far (in reverse) and returns the error.
    pub(crate) async fn acquire_all(
        hooks: Vec<Arc<dyn ResourceHook>>,
    ) -> Result<Self, TaskError> {
        let mut acquired: Vec<Arc<dyn ResourceHook>> = Vec::with_capacity(hooks.len());
        for hook in hooks {
            if let Err(err) = hook.acquire().await {
                for held in acquired.iter().rev() {
                    held.release().await;
                }
                return Err(err);
            }
            acquired.push(hook);
        }
        Ok(Self { acquired })
    }

    /// Release all held hooks in reverse acquisition order.
    pub(crate) async fn release_all(self) {
        for hook in self.acquired.iter().rev() {
            hook.release().await;
        }
    }
}
