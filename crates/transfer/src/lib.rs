//! Resumable chunked transfers with retry, pause/resume and checkpoints.
//!
//! An object is cut into byte-range parts ([`plan`]), each part is moved
//! by a [`ChunkWorker`] under a [`RetryPolicy`], and a bounded number of
//! parts run at once. Downloads are merged into the destination file once
//! every part is on disk; uploads are completed with a single multipart
//! completion call. After every settled part the session is written to a
//! [`CheckpointStore`] so it can be paused, resumed, or restored by
//! another process.
//!
//! [`TransferEngine`] starts sessions and returns a [`SessionHandle`] for
//! control and progress/success/failure callbacks.

mod checkpoint;
mod config;
mod credentials;
mod engine;
mod error;
mod finalize;
mod plan;
mod progress;
mod retry;
mod scheduler;
mod session;
mod types;
mod worker;

pub use checkpoint::{
    Checkpoint, CheckpointPart, CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore,
};
pub use config::{DEFAULT_CHUNK_THRESHOLD, DEFAULT_PART_SIZE, TransferConfig};
pub use credentials::{CredentialBinding, CredentialCache};
pub use engine::TransferEngine;
pub use error::{ClassifiedError, MergeError, TransferError};
pub use finalize::merge;
pub use plan::plan;
pub use progress::{FailureCallback, Progress, ProgressCallback, SuccessCallback, Throughput};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::run as run_parts;
pub use session::{SessionHandle, TransferOutcome};
pub use types::{
    ByteRange, Direction, Part, PartOutcome, PartStatus, SessionState, TransferSession,
};
pub use worker::{ChunkWorker, DownloadWorker, PartFuture, UploadSource, UploadWorker};
