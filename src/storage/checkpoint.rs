use crate::source::position::LogPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub source: String,
    pub position: LogPosition,
}

impl Checkpoint {
    pub fn new(source: impl Into<String>, position: LogPosition) -> Self {
        Self {
            version: CURRENT_VERSION,
            saved_at: Utc::now(),
            source: source.into(),
            position,
        }
    }
}

/// Durable home for the last acknowledged log position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Stores the checkpoint as a small JSON document, replaced atomically.
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// Keeps the latest checkpoint in memory. Clones share state, so a test can
/// hand one clone to a session and inspect another.
#[derive(Clone, Default)]
pub struct MemoryPositionStore {
    saved: Arc<Mutex<Option<Checkpoint>>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Option<LogPosition> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.position)
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.saved.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(checkpoint.clone());
        Ok(())
    }
}

pub struct CheckpointManager {
    store: Arc<dyn PositionStore>,
    source: String,
    interval: Duration,
    last_save: Instant,
    last_saved: Option<LogPosition>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn PositionStore>,
        source: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            source: source.into(),
            interval,
            last_save: Instant::now(),
            last_saved: None,
        }
    }

    /// Load the stored position. Checkpoints written by a different format
    /// version or for a different log source are ignored.
    pub async fn load(&mut self) -> Result<Option<LogPosition>> {
        tracing::info!(source = %self.source, "Loading checkpoint");

        let Some(checkpoint) = self.store.load().await? else {
            tracing::info!("No checkpoint found");
            return Ok(None);
        };

        if checkpoint.version != CURRENT_VERSION {
            tracing::warn!(
                "Checkpoint version mismatch: {} vs {}, ignoring checkpoint",
                checkpoint.version,
                CURRENT_VERSION
            );
            return Ok(None);
        }

        if checkpoint.source != self.source {
            tracing::warn!(
                checkpoint_source = %checkpoint.source,
                source = %self.source,
                "Checkpoint belongs to another log source, ignoring checkpoint"
            );
            return Ok(None);
        }

        tracing::info!(
            position = %checkpoint.position,
            saved_at = %checkpoint.saved_at,
            "Loaded checkpoint"
        );
        self.last_saved = Some(checkpoint.position);
        Ok(Some(checkpoint.position))
    }

    pub async fn save(&mut self, position: LogPosition) -> Result<()> {
        if self.last_saved == Some(position) {
            self.last_save = Instant::now();
            return Ok(());
        }
        self.store
            .save(&Checkpoint::new(self.source.clone(), position))
            .await?;
        self.last_save = Instant::now();
        self.last_saved = Some(position);
        tracing::debug!(position = %position, "Checkpoint saved");
        Ok(())
    }

    pub fn should_save(&self) -> bool {
        self.last_save.elapsed() >= self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FilePositionStore::new(dir.path().join("nested/checkpoint.json"));

        assert!(store.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new("src", LogPosition::new(10, 2));
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, LogPosition::new(10, 2));
        assert_eq!(loaded.source, "src");
    }

    #[tokio::test]
    async fn test_manager_ignores_version_mismatch() {
        let store = Arc::new(MemoryPositionStore::new());
        let mut checkpoint = Checkpoint::new("src", LogPosition::new(1, 1));
        checkpoint.version = 999;
        store.save(&checkpoint).await.unwrap();

        let mut manager = CheckpointManager::new(store, "src", Duration::from_secs(30));
        assert!(manager.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manager_ignores_other_source() {
        let store = Arc::new(MemoryPositionStore::new());
        store
            .save(&Checkpoint::new("other", LogPosition::new(1, 1)))
            .await
            .unwrap();

        let mut manager = CheckpointManager::new(store, "src", Duration::from_secs(30));
        assert!(manager.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manager_should_save() {
        let store = Arc::new(MemoryPositionStore::new());
        let mut manager =
            CheckpointManager::new(store.clone(), "src", Duration::from_millis(100));

        assert!(!manager.should_save());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.should_save());

        manager.save(LogPosition::new(3, 0)).await.unwrap();
        assert!(!manager.should_save());
        assert_eq!(store.position(), Some(LogPosition::new(3, 0)));
    }
}
