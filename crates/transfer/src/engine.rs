use std::path::{Path, PathBuf};
use std::sync::Arc;

use partwise_storage::StorageClient;
use tracing::{debug, warn};

use crate::TransferError;
use crate::checkpoint::{CheckpointStore, offload};
use crate::config::TransferConfig;
use crate::credentials::{CredentialBinding, CredentialCache};
use crate::plan::plan;
use crate::session::{SessionContext, SessionHandle};
use crate::types::{Direction, TransferSession};
use crate::worker::UploadSource;

/// Starts and restores transfer sessions against one storage client.
pub struct TransferEngine {
    client: Arc<dyn StorageClient>,
    store: Arc<dyn CheckpointStore>,
    credentials: Option<CredentialBinding>,
}

impl TransferEngine {
    pub fn new(client: Arc<dyn StorageClient>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            client,
            store,
            credentials: None,
        }
    }

    /// Sends credentials from `cache` (for `endpoint`) with every upload call.
    pub fn with_credentials(
        mut self,
        cache: Arc<CredentialCache>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.credentials = Some(CredentialBinding::new(cache, endpoint));
        self
    }

    fn context(&self, source: Option<UploadSource>) -> SessionContext {
        SessionContext {
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            credentials: self.credentials.clone(),
            source,
        }
    }

    /// Downloads `remote_key` into `local_path`.
    pub async fn start_download(
        &self,
        remote_key: &str,
        local_path: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> Result<SessionHandle, TransferError> {
        config.validate()?;
        let local_path = local_path.into();
        let meta = self.client.head(remote_key).await?;
        let parts = plan(meta.size, config.part_size, config.chunk_threshold)?;

        let id = uuid::Uuid::new_v4().to_string();
        let part_dir = part_dir_for(&local_path, config.temp_dir.as_deref(), &id)?;
        debug!(session = %id, dir = %part_dir.display(), "part directory");

        let session = TransferSession::new(
            id,
            Direction::Download,
            remote_key.to_string(),
            meta.size,
            config,
            parts,
        )
        .with_local_path(local_path)
        .with_temp_dir(part_dir);
        SessionHandle::start(session, self.context(None)).await
    }

    /// Uploads `source` to `remote_key` as a multipart upload.
    pub async fn start_upload(
        &self,
        source: UploadSource,
        remote_key: &str,
        config: TransferConfig,
    ) -> Result<SessionHandle, TransferError> {
        config.validate()?;
        let total_size = source.len().await?;
        let parts = plan(total_size, config.part_size, config.chunk_threshold)?;

        let creds = match &self.credentials {
            Some(binding) => Some(binding.get(false).await.map_err(TransferError::Credentials)?),
            None => None,
        };
        let upload_id = self
            .client
            .create_multipart(remote_key, creds.as_ref())
            .await?;

        let mut session = TransferSession::new(
            uuid::Uuid::new_v4().to_string(),
            Direction::Upload,
            remote_key.to_string(),
            total_size,
            config,
            parts,
        )
        .with_upload_id(upload_id.clone());
        if let Some(path) = source.path() {
            session = session.with_local_path(path.clone());
        }

        match SessionHandle::start(session, self.context(Some(source))).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // Nothing will resume this upload; release it on the server.
                if let Err(e) = self
                    .client
                    .abort_multipart(remote_key, &upload_id, creds.as_ref())
                    .await
                {
                    warn!(
                        key = %remote_key,
                        upload_id = %upload_id,
                        error = %e,
                        "failed to abort multipart upload"
                    );
                }
                Err(err)
            }
        }
    }

    /// Rebuilds a session from its persisted checkpoint, in Paused state.
    ///
    /// File-backed uploads reopen their source path; in-memory uploads
    /// need `source` passed again. Call [`SessionHandle::resume`] to
    /// continue.
    pub async fn restore(
        &self,
        session_id: &str,
        source: Option<UploadSource>,
    ) -> Result<SessionHandle, TransferError> {
        let checkpoint = offload::load(&self.store, session_id.to_string())
            .await?
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))?;
        let done = checkpoint.done_parts();
        let session = offload::restore(checkpoint).await?;

        let source = match (session.direction(), source) {
            (Direction::Download, _) => None,
            (Direction::Upload, Some(source)) => Some(source),
            (Direction::Upload, None) => match session.local_path() {
                Some(path) => Some(UploadSource::File(path)),
                None => {
                    return Err(TransferError::InvalidConfiguration(
                        "in-memory upload needs its payload to be restored".into(),
                    ));
                }
            },
        };
        debug!(session = %session_id, done, "session restored");
        Ok(SessionHandle::restored(session, self.context(source)))
    }
}

/// `<parent>/.<file>.<id>.parts`, or `<temp_dir>/<id>.parts` when a root
/// is configured.
fn part_dir_for(
    local_path: &Path,
    temp_dir: Option<&Path>,
    id: &str,
) -> Result<PathBuf, TransferError> {
    if let Some(root) = temp_dir {
        return Ok(root.join(format!("{id}.parts")));
    }
    let name = local_path
        .file_name()
        .ok_or_else(|| {
            TransferError::InvalidConfiguration(format!(
                "destination has no file name: {}",
                local_path.display()
            ))
        })?
        .to_string_lossy();
    let parent = local_path.parent().unwrap_or(Path::new(""));
    Ok(parent.join(format!(".{name}.{id}.parts")))
}
