//! Checkpoint store on the local filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Checkpoint;
use crate::error::{GatekeeperError, Result};
use crate::id::{file_stem, now_ms};
use crate::storage::{FileLock, LockConfig, read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CheckpointConfig {
    /// TTL applied to checkpoints saved without one.
    pub ttl_ms: u64,
    pub max_checkpoints: usize,
    /// How often the maintenance loop purges expired checkpoints.
    pub cleanup_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 24 * 60 * 60 * 1000,
            max_checkpoints: 100,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub success: bool,
    pub checkpoint_id: String,
    pub path: PathBuf,
    pub error: Option<String>,
}

/// Filesystem checkpoint store.
///
/// Every write takes the store-wide advisory lock, so several schedulers can share
/// one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointConfig,
    lock: LockConfig,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, config: CheckpointConfig, lock: LockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            lock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Path of the checkpoint file for a task.
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(task_id)))
    }

    async fn lock_store(&self) -> Result<FileLock> {
        tokio::fs::create_dir_all(&self.dir).await?;
        FileLock::acquire(&self.dir, &self.lock).await
    }

    /// Persist a checkpoint, replacing any earlier one for the same task.
    ///
    /// Failures are reported in the outcome, never raised.
    pub async fn save(&self, mut checkpoint: Checkpoint) -> SaveOutcome {
        if checkpoint.ttl_ms == 0 {
            checkpoint.ttl_ms = self.config.ttl_ms;
        }
        checkpoint.progress = checkpoint.progress.clamp(0.0, 1.0);

        let path = self.path_for(&checkpoint.task_id);
        let written = async {
            let _lock = self.lock_store().await?;
            write_json_atomic(&path, &checkpoint).await
        }
        .await;

        match written {
            Ok(()) => {
                tracing::debug!(task_id = %checkpoint.task_id, checkpoint_id = %checkpoint.id, "Checkpoint saved");
                if let Err(e) = self.enforce_max_checkpoints().await {
                    tracing::warn!(error = %e, "Checkpoint capacity sweep failed");
                }
                SaveOutcome {
                    success: true,
                    checkpoint_id: checkpoint.id,
                    path,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %checkpoint.task_id, error = %e, "Checkpoint save failed");
                SaveOutcome {
                    success: false,
                    checkpoint_id: checkpoint.id,
                    path,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Live checkpoint for a task. Missing and expired both read as `None`.
    pub async fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        self.load_at(task_id, now_ms()).await
    }

    pub async fn load_at(&self, task_id: &str, now_ms: u64) -> Result<Option<Checkpoint>> {
        let checkpoint: Option<Checkpoint> = read_json(&self.path_for(task_id)).await?;
        Ok(checkpoint.filter(|c| c.task_id == task_id && !c.is_expired_at(now_ms)))
    }

    /// Like [`load`](Self::load), but a missing checkpoint is an error.
    pub async fn require(&self, task_id: &str) -> Result<Checkpoint> {
        self.load(task_id)
            .await?
            .ok_or_else(|| GatekeeperError::NotFound(format!("checkpoint for task {}", task_id)))
    }

    /// Remove the checkpoint for a task. Returns whether one existed.
    ///
    /// A file holding another task's checkpoint is left alone.
    pub async fn delete(&self, task_id: &str) -> Result<bool> {
        let _lock = self.lock_store().await?;
        let path = self.path_for(task_id);
        match read_json::<Checkpoint>(&path).await {
            Ok(Some(c)) if c.task_id != task_id => Ok(false),
            Ok(None) => Ok(false),
            // Unreadable files still belong to whoever maps to this path
            _ => remove_if_exists(&path).await,
        }
    }

    /// Every readable checkpoint, expired or not, oldest first.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match read_json::<Checkpoint>(&path).await {
                Ok(Some(checkpoint)) => checkpoints.push(checkpoint),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }

        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }

    pub async fn list_expired(&self) -> Result<Vec<Checkpoint>> {
        self.list_expired_at(now_ms()).await
    }

    pub async fn list_expired_at(&self, now_ms: u64) -> Result<Vec<Checkpoint>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_expired_at(now_ms))
            .collect())
    }

    /// Purge expired checkpoints. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        self.cleanup_at(now_ms()).await
    }

    pub async fn cleanup_at(&self, now_ms: u64) -> Result<usize> {
        let expired = self.list_expired_at(now_ms).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let _lock = self.lock_store().await?;
        let mut removed = 0;
        for checkpoint in expired {
            // Re-read under the lock: the task may have saved a fresh one meanwhile
            let path = self.path_for(&checkpoint.task_id);
            let current: Option<Checkpoint> = read_json(&path).await.ok().flatten();
            if current.is_some_and(|c| c.is_expired_at(now_ms)) && remove_if_exists(&path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Removed {} expired checkpoint(s) from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    /// Evict the oldest checkpoints beyond `max_checkpoints`. Returns how many were evicted.
    pub async fn enforce_max_checkpoints(&self) -> Result<usize> {
        let checkpoints = self.list().await?;
        let excess = checkpoints.len().saturating_sub(self.config.max_checkpoints);
        if excess == 0 {
            return Ok(0);
        }

        let _lock = self.lock_store().await?;
        let mut evicted = 0;
        for checkpoint in checkpoints.iter().take(excess) {
            if remove_if_exists(&self.path_for(&checkpoint.task_id)).await? {
                evicted += 1;
            }
        }
        log::info!("Evicted {} checkpoint(s) over the cap of {}", evicted, self.config.max_checkpoints);
        Ok(evicted)
    }
}
