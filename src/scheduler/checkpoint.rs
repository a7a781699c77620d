//! Best-effort persistence of the pending set.
//!
//! The file holds only what is needed to re-enqueue work after a restart:
//! tasks that had not started (or were waiting out a retry backoff) and the
//! next id to hand out. It is rewritten wholesale on every save.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::handler::Metadata;
use crate::id::TaskId;
use crate::scheduler::priority::Priority;
use crate::scheduler::task::{Task, TaskStatus};

/// Pending-only view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointTask {
    pub id: TaskId,
    pub payload: String,
    pub priority: Priority,
    pub target_model: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: u64,
}

impl From<&Task> for CheckpointTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            payload: task.payload.clone(),
            priority: task.priority,
            target_model: task.target_model.clone(),
            metadata: task.metadata.clone(),
            attempts: task.attempts,
            max_retries: task.max_retries,
            timeout_ms: task.timeout_ms,
            created_at: task.created_at,
        }
    }
}

impl CheckpointTask {
    /// Rebuild a Pending task from its persisted form
    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            payload: self.payload,
            priority: self.priority,
            target_model: self.target_model,
            metadata: self.metadata,
            status: TaskStatus::Pending,
            attempts: self.attempts,
            max_retries: self.max_retries,
            timeout_ms: self.timeout_ms,
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// On-disk checkpoint document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub queued: Vec<CheckpointTask>,
    pub next_id: u64,
}

impl Checkpoint {
    pub fn new(queued: Vec<CheckpointTask>, next_id: u64) -> Self {
        Self { queued, next_id }
    }

    /// Read a checkpoint. A missing file is `Ok(None)`, not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        Ok(Some(checkpoint))
    }

    /// Overwrite the checkpoint file.
    ///
    /// Writes a sibling temp file and renames it over the target so a crash
    /// mid-write never leaves a truncated document behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp = temp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
