//! Session control: the run task behind a [`SessionHandle`] and the
//! pause/resume/cancel operations callers drive it with.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use partwise_storage::{CompletedPart, StorageClient};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::checkpoint::{Checkpoint, CheckpointStore, offload};
use crate::credentials::CredentialBinding;
use crate::error::ClassifiedError;
use crate::finalize;
use crate::progress::{Callbacks, Progress, Throughput};
use crate::scheduler;
use crate::types::{Direction, PartStatus, SessionState, TransferSession};
use crate::worker::{ChunkWorker, DownloadWorker, UploadSource, UploadWorker};

/// Result of a successful session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransferOutcome {
    #[serde(rename_all = "camelCase")]
    Downloaded {
        path: PathBuf,
        size: u64,
        /// Hex SHA-256 of the merged file.
        sha256: String,
    },
    #[serde(rename_all = "camelCase")]
    Uploaded {
        remote_key: String,
        size: u64,
        etag: String,
        parts: usize,
    },
}

/// Collaborators a session runs against.
pub(crate) struct SessionContext {
    pub client: Arc<dyn StorageClient>,
    pub store: Arc<dyn CheckpointStore>,
    pub credentials: Option<CredentialBinding>,
    pub source: Option<UploadSource>,
}

struct Shared {
    ctx: SessionContext,
    session: RwLock<Arc<TransferSession>>,
    control: tokio::sync::Mutex<Control>,
    callbacks: Callbacks,
    state: watch::Sender<SessionState>,
    speed: Throughput,
}

struct Control {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Shared {
    fn session(&self) -> Arc<TransferSession> {
        Arc::clone(&self.session.read().unwrap())
    }

    fn progress(&self, session: &TransferSession) -> Progress {
        let progress = Progress::new(
            session.checkpoint(),
            session.transferred_bytes(),
            self.speed.bytes_per_second(),
        );
        let eta = self.speed.eta(progress.remaining_bytes());
        progress.with_eta(eta)
    }

    /// Saves `checkpoint`, logging instead of failing the run.
    async fn persist(&self, checkpoint: Checkpoint) {
        let id = checkpoint.session_id.clone();
        if let Err(e) = offload::save(&self.ctx.store, checkpoint).await {
            warn!(session = %id, error = %e, "failed to save checkpoint");
        }
    }
}

/// Handle to one running, paused or finished transfer.
///
/// Cloning the handle is cheap; all clones control the same session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Moves `session` to Running and spawns its run task.
    pub(crate) async fn start(
        session: TransferSession,
        ctx: SessionContext,
    ) -> Result<Self, TransferError> {
        session.transition("start", SessionState::Running)?;
        offload::save(&ctx.store, session.checkpoint()).await?;

        let handle = Self::new(session, ctx);
        let session = handle.shared.session();
        let mut control = handle.shared.control.lock().await;
        info!(
            session = %session.id(),
            direction = ?session.direction(),
            key = %session.remote_key(),
            bytes = session.total_size(),
            parts = session.parts().len(),
            "transfer started"
        );
        control.task = Some(tokio::spawn(drive(
            Arc::clone(&handle.shared),
            session,
            control.cancel.clone(),
        )));
        drop(control);
        Ok(handle)
    }

    /// Wraps an already paused session (restored from a checkpoint).
    pub(crate) fn restored(session: TransferSession, ctx: SessionContext) -> Self {
        Self::new(session, ctx)
    }

    fn new(session: TransferSession, ctx: SessionContext) -> Self {
        let (state, _) = watch::channel(session.state());
        Self {
            shared: Arc::new(Shared {
                ctx,
                session: RwLock::new(Arc::new(session)),
                control: tokio::sync::Mutex::new(Control {
                    cancel: CancellationToken::new(),
                    task: None,
                }),
                callbacks: Callbacks::default(),
                state,
                speed: Throughput::default(),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.shared.session().id()
    }

    pub fn state(&self) -> SessionState {
        self.shared.session().state()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        let session = self.shared.session();
        self.shared.progress(&session)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.shared.session().checkpoint()
    }

    /// The outcome, once the session has completed.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.shared.callbacks.outcome()
    }

    /// The error, once the session has failed.
    pub fn failure(&self) -> Option<Arc<TransferError>> {
        self.shared.callbacks.failure()
    }

    /// Called after every settled part.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.shared.callbacks.on_progress(Arc::new(callback));
    }

    /// Called once if the session completes.
    pub fn on_success<F>(&self, callback: F)
    where
        F: FnOnce(&TransferOutcome) + Send + 'static,
    {
        self.shared.callbacks.on_success(Box::new(callback));
    }

    /// Called once if the session fails.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: FnOnce(&TransferError) + Send + 'static,
    {
        self.shared.callbacks.on_failure(Box::new(callback));
    }

    /// Resolves once the session reaches Completed, Failed or Cancelled.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Interrupts in-flight parts and persists a checkpoint.
    ///
    /// Only valid while Running. Parts that were in flight go back to
    /// Pending.
    pub async fn pause(&self) -> Result<(), TransferError> {
        let mut control = self.shared.control.lock().await;
        let session = self.shared.session();
        let state = session.state();
        if state != SessionState::Running {
            return Err(TransferError::InvalidState { op: "pause", state });
        }

        control.cancel.cancel();
        if let Some(task) = control.task.take() {
            task.await
                .map_err(|e| TransferError::Worker(e.to_string()))?;
        }

        // The run may have finished on its own while we waited.
        session.revert_in_flight();
        session.transition("pause", SessionState::Paused)?;
        let saved = offload::save(&self.shared.ctx.store, session.checkpoint()).await;
        self.shared.state.send_replace(SessionState::Paused);
        info!(
            session = %session.id(),
            done = session.count_with_status(PartStatus::Done),
            "transfer paused"
        );
        saved
    }

    /// Continues a paused session from its stored checkpoint.
    pub async fn resume(&self) -> Result<(), TransferError> {
        let mut control = self.shared.control.lock().await;
        let current = self.shared.session();
        let state = current.state();
        if state != SessionState::Paused {
            return Err(TransferError::InvalidState { op: "resume", state });
        }

        let checkpoint = match offload::load(&self.shared.ctx.store, current.id()).await? {
            Some(checkpoint) => checkpoint,
            None => current.checkpoint(),
        };
        let session = Arc::new(offload::restore(checkpoint).await?);
        session.transition("resume", SessionState::Running)?;
        *self.shared.session.write().unwrap() = Arc::clone(&session);

        control.cancel = CancellationToken::new();
        self.shared.speed.restart();
        self.shared.state.send_replace(SessionState::Running);
        info!(
            session = %session.id(),
            remaining = session.count_with_status(PartStatus::Pending),
            "transfer resumed"
        );
        control.task = Some(tokio::spawn(drive(
            Arc::clone(&self.shared),
            session,
            control.cancel.clone(),
        )));
        Ok(())
    }

    /// Stops the session for good: interrupts in-flight parts, deletes
    /// temp part files, discards the checkpoint and drops all callbacks.
    pub async fn cancel(&self) -> Result<(), TransferError> {
        let mut control = self.shared.control.lock().await;
        let session = self.shared.session();
        let state = session.state();
        if state.is_terminal() {
            return Err(TransferError::InvalidState { op: "cancel", state });
        }

        self.shared.callbacks.silence();
        control.cancel.cancel();
        if let Some(task) = control.task.take()
            && let Err(e) = task.await
        {
            warn!(session = %session.id(), error = %e, "run task ended abnormally");
        }

        session.transition("cancel", SessionState::Cancelled)?;
        self.shared.callbacks.cancel();
        self.cleanup(&session).await;
        let removed = offload::remove(&self.shared.ctx.store, session.id()).await;
        self.shared.state.send_replace(SessionState::Cancelled);
        info!(session = %session.id(), "transfer cancelled");
        removed
    }

    async fn cleanup(&self, session: &TransferSession) {
        match session.direction() {
            Direction::Download => {
                if let Some(dir) = session.temp_dir() {
                    match tokio::fs::remove_dir_all(&dir).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(
                                path = %dir.display(),
                                error = %e,
                                "failed to remove part directory"
                            )
                        }
                    }
                }
            }
            Direction::Upload => {
                let Some(upload_id) = session.upload_id() else {
                    return;
                };
                let creds = match &self.shared.ctx.credentials {
                    Some(binding) => binding.get(false).await.ok(),
                    None => None,
                };
                let key = session.remote_key();
                if let Err(e) = self
                    .shared
                    .ctx
                    .client
                    .abort_multipart(&key, &upload_id, creds.as_ref())
                    .await
                {
                    warn!(session = %session.id(), error = %e, "failed to abort multipart upload");
                }
            }
        }
    }
}

/// Body of the run task.
async fn drive(shared: Arc<Shared>, session: Arc<TransferSession>, cancel: CancellationToken) {
    let id = session.id();
    let result = match session.direction() {
        Direction::Download => download(&shared, &session, &cancel).await,
        Direction::Upload => upload(&shared, &session, &cancel).await,
    };

    match result {
        Ok(outcome) => {
            if let Err(e) = session.transition("complete", SessionState::Completed) {
                warn!(session = %id, error = %e, "completed run could not be recorded");
                return;
            }
            if let Err(e) = offload::remove(&shared.ctx.store, id.clone()).await {
                warn!(session = %id, error = %e, "failed to discard checkpoint");
            }
            info!(session = %id, ?outcome, "transfer completed");
            shared.callbacks.succeed(outcome);
            shared.state.send_replace(SessionState::Completed);
        }
        Err(e) if cancel.is_cancelled() => {
            // Pause or cancel owns the state change.
            debug!(session = %id, error = %e, "run interrupted");
        }
        Err(err) => {
            session.revert_in_flight();
            if session.transition("fail", SessionState::Failed).is_err() {
                return;
            }
            shared.persist(session.checkpoint()).await;
            error!(session = %id, error = %err, "transfer failed");
            shared.callbacks.fail(err);
            shared.state.send_replace(SessionState::Failed);
        }
    }
}

/// Runs the scheduler, checkpointing and reporting progress per part.
async fn dispatch(
    shared: &Shared,
    session: &TransferSession,
    worker: Arc<dyn ChunkWorker>,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let config = session.config();
    let policy = config.retry_policy();
    let mut last = session.transferred_bytes();

    scheduler::run(
        session,
        worker,
        &policy,
        config.max_concurrency,
        cancel,
        move |index| {
            let transferred = session.transferred_bytes();
            shared.speed.record(index, transferred.saturating_sub(last));
            last = transferred;

            let progress = shared.progress(session);
            async move {
                shared.persist(progress.checkpoint.clone()).await;
                shared.callbacks.emit_progress(&progress);
            }
        },
    )
    .await
}

async fn download(
    shared: &Shared,
    session: &TransferSession,
    cancel: &CancellationToken,
) -> Result<TransferOutcome, TransferError> {
    let (Some(temp_dir), Some(destination)) = (session.temp_dir(), session.local_path()) else {
        return Err(TransferError::Checkpoint(
            "download session is missing its destination or part directory".into(),
        ));
    };
    let worker = Arc::new(DownloadWorker::new(
        Arc::clone(&shared.ctx.client),
        session.remote_key(),
        temp_dir.clone(),
    ));
    dispatch(shared, session, worker, cancel).await?;

    let parts = session.parts();
    let total_size = session.total_size();
    let target = destination.clone();
    let sha256 =
        tokio::task::spawn_blocking(move || finalize::merge(&parts, &target, total_size))
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))??;
    finalize::remove_part_dir(&temp_dir);

    Ok(TransferOutcome::Downloaded {
        path: destination,
        size: total_size,
        sha256,
    })
}

async fn upload(
    shared: &Shared,
    session: &TransferSession,
    cancel: &CancellationToken,
) -> Result<TransferOutcome, TransferError> {
    let id = session.id();
    let key = session.remote_key();
    let upload_id = session
        .upload_id()
        .ok_or_else(|| TransferError::Checkpoint("upload session has no upload id".into()))?;
    let source = shared.ctx.source.clone().ok_or_else(|| {
        TransferError::InvalidConfiguration("upload session has no payload".into())
    })?;
    let worker: Arc<dyn ChunkWorker> = Arc::new(UploadWorker::new(
        Arc::clone(&shared.ctx.client),
        key.clone(),
        upload_id.clone(),
        source,
        shared.ctx.credentials.clone(),
    ));

    let reupload_attempts = session.config().reupload_attempts;
    let mut refreshes = 0;
    loop {
        let err = match dispatch(shared, session, Arc::clone(&worker), cancel).await {
            Ok(()) => break,
            Err(err) => err,
        };
        let Some(binding) = shared
            .ctx
            .credentials
            .as_ref()
            .filter(|_| err.is_credential_expired())
        else {
            return Err(err);
        };
        let last_error = err
            .part_error()
            .cloned()
            .unwrap_or(ClassifiedError::CredentialExpired(err.to_string()));
        if refreshes >= reupload_attempts {
            return Err(TransferError::ReuploadFailed {
                attempts: refreshes,
                last_error,
            });
        }
        refreshes += 1;
        warn!(
            session = %id,
            attempt = refreshes,
            "credentials expired, refreshing and re-dispatching"
        );

        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Aborted),
            result = binding.get(true) => result,
        };
        if let Err(e) = refreshed {
            return Err(TransferError::ReuploadFailed {
                attempts: refreshes,
                last_error: e,
            });
        }
        // Done parts keep their ETags; only the failed ones go again.
        session.reset_failed();
    }

    let completed: Vec<CompletedPart> = session
        .parts()
        .iter()
        .filter_map(|p| {
            p.part_id.clone().map(|etag| CompletedPart {
                part_number: p.part_number(),
                etag,
            })
        })
        .collect();
    let creds = match &shared.ctx.credentials {
        Some(binding) => Some(tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Aborted),
            result = binding.get(false) => result.map_err(TransferError::Credentials)?,
        }),
        None => None,
    };
    let meta = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Aborted),
        result = shared
            .ctx
            .client
            .complete_multipart(&key, &upload_id, &completed, creds.as_ref()) => result?,
    };

    Ok(TransferOutcome::Uploaded {
        remote_key: key,
        size: meta.size,
        etag: meta.etag,
        parts: completed.len(),
    })
}
