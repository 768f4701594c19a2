use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{CheckpointBackend, CheckpointConfig};
use crate::error::{AppError, Result};
use crate::workflow::manager::Run;

/// Durable store for run checkpoints, one document per run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, run: &Run) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<Run>>;

    async fn remove(&self, run_id: Uuid) -> Result<()>;
}

pub fn from_config(config: &CheckpointConfig) -> Box<dyn CheckpointStore> {
    match config.backend {
        CheckpointBackend::Memory => Box::new(MemoryCheckpointStore::default()),
        CheckpointBackend::File => Box::new(FileCheckpointStore::new(&config.dir)),
    }
}

/// Checkpoints kept only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, run: &Run) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(run.context.run_id(), run.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Run>> {
        Ok(self.runs.read().await.values().cloned().collect())
    }

    async fn remove(&self, run_id: Uuid) -> Result<()> {
        self.runs.write().await.remove(&run_id);
        Ok(())
    }
}

/// One `<run_id>.json` file per run.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run: &Run) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let run_id = run.context.run_id();
        let path = self.path_for(run_id);
        // Write then rename so a crash never leaves a torn checkpoint.
        let tmp = self.dir.join(format!(".{run_id}.json.tmp"));
        let body = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(run_id = %run_id, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Run>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_checkpoint = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_checkpoint {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Run>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        Ok(runs)
    }

    async fn remove(&self, run_id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Checkpoint(format!(
                "failed to remove checkpoint for {run_id}: {e}"
            ))),
        }
    }
}
