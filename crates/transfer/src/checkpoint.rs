//! Durable session snapshots for pause/resume.
//!
//! A [`Checkpoint`] is a flat, serializable projection of a
//! [`TransferSession`](crate::TransferSession). It is rewritten after
//! every part settles and can be reloaded by another process to resume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TransferError;
use crate::config::TransferConfig;
use crate::error::ClassifiedError;
use crate::types::{Direction, Part, PartStatus, SessionState};

/// Serializable snapshot of a transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: String,
    pub direction: Direction,
    pub remote_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    pub total_size: u64,
    pub part_size: u64,
    pub state: SessionState,
    #[serde(default)]
    pub config: TransferConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parts: Vec<CheckpointPart>,
}

/// Per-part entry of a [`Checkpoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPart {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub status: PartStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ClassifiedError>,
}

impl From<&Part> for CheckpointPart {
    fn from(part: &Part) -> Self {
        Self {
            index: part.index,
            start: part.range.start,
            end: part.range.end,
            status: part.status,
            temp_location: part.temp_location.clone(),
            part_id: part.part_id.clone(),
            retry_count: part.retry_count,
            last_error: part.last_error.clone(),
        }
    }
}

impl Checkpoint {
    /// Checks that the parts still partition `[0, total_size)` in order.
    pub fn validate(&self) -> Result<(), TransferError> {
        let mut expected_start = 0;
        for (i, part) in self.parts.iter().enumerate() {
            if part.index != i || part.start != expected_start || part.end < part.start {
                return Err(TransferError::Checkpoint(format!(
                    "session {}: part {} breaks the byte partition",
                    self.session_id, part.index
                )));
            }
            expected_start = part.end;
        }
        if expected_start != self.total_size || self.parts.is_empty() {
            return Err(TransferError::Checkpoint(format!(
                "session {}: parts cover {expected_start} of {} bytes",
                self.session_id, self.total_size
            )));
        }
        Ok(())
    }

    /// Number of parts recorded as Done.
    pub fn done_parts(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| p.status == PartStatus::Done)
            .count()
    }
}

/// Persistence for checkpoints, keyed by session ID.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), TransferError>;

    fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, TransferError>;

    fn remove(&self, session_id: &str) -> Result<(), TransferError>;
}

/// Stores each checkpoint as `<dir>/<session_id>.json`.
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    /// Creates a store rooted at `dir` (created on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, TransferError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TransferError::Checkpoint(format!(
                "invalid session id: {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), TransferError> {
        let path = self.path_for(&checkpoint.session_id)?;
        std::fs::create_dir_all(&self.dir)?;

        // Write-then-rename so readers never see a torn file.
        let staging = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, &path)?;

        debug!(
            session = %checkpoint.session_id,
            done = checkpoint.done_parts(),
            parts = checkpoint.parts.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, TransferError> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&data)?;
        Ok(Some(checkpoint))
    }

    fn remove(&self, session_id: &str) -> Result<(), TransferError> {
        let path = self.path_for(session_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps checkpoints in memory only.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), TransferError> {
        self.checkpoints
            .write()
            .unwrap()
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, TransferError> {
        Ok(self.checkpoints.read().unwrap().get(session_id).cloned())
    }

    fn remove(&self, session_id: &str) -> Result<(), TransferError> {
        self.checkpoints.write().unwrap().remove(session_id);
        Ok(())
    }
}

/// Checkpoint I/O on the blocking pool, for use from async code.
pub(crate) mod offload {
    use std::sync::Arc;

    use super::{Checkpoint, CheckpointStore};
    use crate::TransferError;
    use crate::types::TransferSession;

    async fn blocking<T, F>(f: F) -> Result<T, TransferError>
    where
        F: FnOnce() -> Result<T, TransferError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TransferError::Worker(format!("checkpoint task join error: {e}")))?
    }

    pub(crate) async fn save(
        store: &Arc<dyn CheckpointStore>,
        checkpoint: Checkpoint,
    ) -> Result<(), TransferError> {
        let store = Arc::clone(store);
        blocking(move || store.save(&checkpoint)).await
    }

    pub(crate) async fn load(
        store: &Arc<dyn CheckpointStore>,
        session_id: String,
    ) -> Result<Option<Checkpoint>, TransferError> {
        let store = Arc::clone(store);
        blocking(move || store.load(&session_id)).await
    }

    pub(crate) async fn remove(
        store: &Arc<dyn CheckpointStore>,
        session_id: String,
    ) -> Result<(), TransferError> {
        let store = Arc::clone(store);
        blocking(move || store.remove(&session_id)).await
    }

    /// Rebuilds a session; this stats every Done part file.
    pub(crate) async fn restore(checkpoint: Checkpoint) -> Result<TransferSession, TransferError> {
        blocking(move || TransferSession::from_checkpoint(&checkpoint)).await
    }
}
