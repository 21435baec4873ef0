//! File-backed checkpoint store.

use std::path::{Path, PathBuf};
use tokio::fs;

use super::{Checkpoint, CheckpointStore, PersistenceError};

/// Checkpoint store backed by a single JSON file.
///
/// Saves are atomic: the snapshot is written to a sibling temp file and
/// renamed over the target, so a crash mid-write leaves the previous
/// snapshot intact rather than a truncated one.
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    /// Create a store writing to the given path.
    ///
    /// The file does not need to exist; it is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_vec_pretty(checkpoint)?;

        let temp = self.temp_path();
        fs::write(&temp, &encoded).await?;
        fs::rename(&temp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), tasks = checkpoint.tasks.len(), "checkpoint written");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, PersistenceError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let checkpoint = serde_json::from_slice(&raw)?;
        Ok(Some(checkpoint))
    }
}
