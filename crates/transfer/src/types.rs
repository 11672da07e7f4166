use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::checkpoint::{Checkpoint, CheckpointPart};
use crate::config::TransferConfig;
use crate::error::ClassifiedError;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Download,
    Upload,
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Completed, Failed and Cancelled sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Transitions only move forward, except Running <-> Paused.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

/// Status of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_range(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

/// One chunk's unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// 0-based; defines merge order.
    pub index: usize,
    pub range: ByteRange,
    pub status: PartStatus,
    /// Failed attempts so far. Never exceeds the configured attempt limit.
    pub retry_count: u32,
    pub last_error: Option<ClassifiedError>,
    /// Download only: where the part's bytes were written.
    pub temp_location: Option<PathBuf>,
    /// Upload only: ETag returned for the uploaded part.
    pub part_id: Option<String>,
    pub transferred_bytes: u64,
}

impl Part {
    pub fn new(index: usize, range: ByteRange) -> Self {
        Self {
            index,
            range,
            status: PartStatus::Pending,
            retry_count: 0,
            last_error: None,
            temp_location: None,
            part_id: None,
            transferred_bytes: 0,
        }
    }

    /// 1-based number used by multipart protocols.
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// What a successful part transfer produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartOutcome {
    pub bytes: u64,
    pub temp_location: Option<PathBuf>,
    pub part_id: Option<String>,
}

/// One logical object transfer (thread-safe).
///
/// Part status is only mutated by the scheduler loop that owns the
/// session; readers (progress, checkpoint) take snapshots.
pub struct TransferSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    id: String,
    direction: Direction,
    remote_key: String,
    local_path: Option<PathBuf>,
    upload_id: Option<String>,
    temp_dir: Option<PathBuf>,
    total_size: u64,
    config: TransferConfig,
    parts: Vec<Part>,
    state: SessionState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransferSession {
    /// Creates a new pending session over already planned parts.
    pub fn new(
        id: String,
        direction: Direction,
        remote_key: String,
        total_size: u64,
        config: TransferConfig,
        parts: Vec<Part>,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: RwLock::new(SessionInner {
                id,
                direction,
                remote_key,
                local_path: None,
                upload_id: None,
                temp_dir: None,
                total_size,
                config,
                parts,
                state: SessionState::Pending,
                created_at: now,
                updated_at: now,
            }),
        }
    }

    pub fn with_local_path(self, path: PathBuf) -> Self {
        self.inner.write().unwrap().local_path = Some(path);
        self
    }

    pub fn with_temp_dir(self, dir: PathBuf) -> Self {
        self.inner.write().unwrap().temp_dir = Some(dir);
        self
    }

    pub fn with_upload_id(self, upload_id: String) -> Self {
        self.inner.write().unwrap().upload_id = Some(upload_id);
        self
    }

    /// Rebuilds a paused session from a checkpoint.
    ///
    /// Parts that were in flight or failed go back to Pending with a fresh
    /// retry budget. Download parts marked Done whose temp file is missing
    /// or has the wrong length also go back to Pending.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, TransferError> {
        checkpoint.validate()?;
        let parts = checkpoint
            .parts
            .iter()
            .map(|cp| restore_part(checkpoint.direction, cp))
            .collect();
        Ok(Self {
            inner: RwLock::new(SessionInner {
                id: checkpoint.session_id.clone(),
                direction: checkpoint.direction,
                remote_key: checkpoint.remote_key.clone(),
                local_path: checkpoint.local_path.clone(),
                upload_id: checkpoint.upload_id.clone(),
                temp_dir: checkpoint.temp_dir.clone(),
                total_size: checkpoint.total_size,
                config: checkpoint.config.clone(),
                parts,
                state: SessionState::Paused,
                created_at: checkpoint.created_at,
                updated_at: Utc::now(),
            }),
        })
    }

    /// Snapshot of the session sufficient to resume it later.
    pub fn checkpoint(&self) -> Checkpoint {
        let s = self.inner.read().unwrap();
        Checkpoint {
            session_id: s.id.clone(),
            direction: s.direction,
            remote_key: s.remote_key.clone(),
            local_path: s.local_path.clone(),
            upload_id: s.upload_id.clone(),
            temp_dir: s.temp_dir.clone(),
            total_size: s.total_size,
            part_size: s.config.part_size,
            state: s.state,
            config: s.config.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            parts: s.parts.iter().map(CheckpointPart::from).collect(),
        }
    }

    /// Moves the session to `next`, rejecting illegal transitions.
    pub fn transition(&self, op: &'static str, next: SessionState) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        if !s.state.can_transition_to(next) {
            return Err(TransferError::InvalidState { op, state: s.state });
        }
        s.state = next;
        s.updated_at = Utc::now();
        Ok(())
    }

    /// Claims the lowest-index Pending part, marking it InFlight.
    pub fn claim_next_pending(&self) -> Option<Part> {
        let mut s = self.inner.write().unwrap();
        let part = s
            .parts
            .iter_mut()
            .find(|p| p.status == PartStatus::Pending)?;
        part.status = PartStatus::InFlight;
        let claimed = part.clone();
        s.updated_at = Utc::now();
        Some(claimed)
    }

    /// Records a successful part transfer.
    pub fn mark_done(&self, index: usize, outcome: PartOutcome, attempts: u32) {
        let mut s = self.inner.write().unwrap();
        if let Some(part) = s.parts.get_mut(index) {
            part.status = PartStatus::Done;
            part.retry_count = attempts.saturating_sub(1);
            part.last_error = None;
            part.transferred_bytes = outcome.bytes;
            part.temp_location = outcome.temp_location;
            part.part_id = outcome.part_id;
        }
        s.updated_at = Utc::now();
    }

    /// Records a part that will not be retried within this run.
    pub fn mark_failed(&self, index: usize, error: ClassifiedError, attempts: u32) {
        let mut s = self.inner.write().unwrap();
        if let Some(part) = s.parts.get_mut(index) {
            part.status = PartStatus::Failed;
            part.retry_count = attempts;
            part.last_error = Some(error);
            part.transferred_bytes = 0;
        }
        s.updated_at = Utc::now();
    }

    /// Returns an aborted part to Pending.
    pub fn release_part(&self, index: usize) {
        let mut s = self.inner.write().unwrap();
        if let Some(part) = s.parts.get_mut(index)
            && part.status == PartStatus::InFlight
        {
            part.status = PartStatus::Pending;
        }
    }

    /// Returns every InFlight part to Pending. Returns how many moved.
    pub fn revert_in_flight(&self) -> usize {
        let mut s = self.inner.write().unwrap();
        let mut moved = 0;
        for part in s.parts.iter_mut().filter(|p| p.status == PartStatus::InFlight) {
            part.status = PartStatus::Pending;
            moved += 1;
        }
        moved
    }

    /// Returns every Failed part to Pending with a fresh retry budget.
    pub fn reset_failed(&self) -> usize {
        let mut s = self.inner.write().unwrap();
        let mut moved = 0;
        for part in s.parts.iter_mut().filter(|p| p.status == PartStatus::Failed) {
            part.status = PartStatus::Pending;
            part.retry_count = 0;
            moved += 1;
        }
        moved
    }

    /// Snapshot of all parts, in index order.
    pub fn parts(&self) -> Vec<Part> {
        self.inner.read().unwrap().parts.clone()
    }

    /// Bytes belonging to Done parts.
    pub fn transferred_bytes(&self) -> u64 {
        let s = self.inner.read().unwrap();
        s.parts
            .iter()
            .filter(|p| p.status == PartStatus::Done)
            .map(|p| p.transferred_bytes)
            .sum()
    }

    /// Returns `true` once every part is Done.
    pub fn is_complete(&self) -> bool {
        let s = self.inner.read().unwrap();
        s.parts.iter().all(|p| p.status == PartStatus::Done)
    }

    pub fn count_with_status(&self, status: PartStatus) -> usize {
        let s = self.inner.read().unwrap();
        s.parts.iter().filter(|p| p.status == status).count()
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    pub fn direction(&self) -> Direction {
        self.inner.read().unwrap().direction
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().unwrap().state
    }

    pub fn remote_key(&self) -> String {
        self.inner.read().unwrap().remote_key.clone()
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().local_path.clone()
    }

    pub fn upload_id(&self) -> Option<String> {
        self.inner.read().unwrap().upload_id.clone()
    }

    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().temp_dir.clone()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.read().unwrap().total_size
    }

    pub fn config(&self) -> TransferConfig {
        self.inner.read().unwrap().config.clone()
    }
}

fn restore_part(direction: Direction, cp: &CheckpointPart) -> Part {
    let range = ByteRange::new(cp.start, cp.end);
    let mut part = Part::new(cp.index, range);
    part.last_error = cp.last_error.clone();

    if cp.status != PartStatus::Done {
        return part;
    }
    let usable = match direction {
        Direction::Download => cp
            .temp_location
            .as_deref()
            .is_some_and(|path| temp_file_matches(path, range.len())),
        Direction::Upload => cp.part_id.is_some(),
    };
    if usable {
        part.status = PartStatus::Done;
        part.retry_count = cp.retry_count;
        part.transferred_bytes = range.len();
        part.temp_location = cp.temp_location.clone();
        part.part_id = cp.part_id.clone();
    }
    part
}

fn temp_file_matches(path: &Path, expected: u64) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == expected)
}
