//! In-memory checkpoint store for tests and ephemeral runs.

use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointStore, PersistenceError};

/// Checkpoint store that keeps the latest snapshot in memory.
///
/// Nothing survives process exit; useful in tests and for runs where
/// durability is not wanted but the checkpointing code path should still
/// be exercised.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    slot: RwLock<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        *self.slot.write().await = Some(checkpoint.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, PersistenceError> {
        Ok(self.slot.read().await.clone())
    }
}
