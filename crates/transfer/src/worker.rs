//! Per-part transfer workers.
//!
//! A worker moves exactly one part per call: a range read streamed into
//! a temp file (download) or one part upload (upload). Both honor the
//! cancellation token by dropping the in-flight storage call.

use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use partwise_storage::{StorageClient, StorageError};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::credentials::CredentialBinding;
use crate::error::ClassifiedError;
use crate::types::{Part, PartOutcome};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Boxed future returned by [`ChunkWorker::transfer`].
pub type PartFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PartOutcome, ClassifiedError>> + Send + 'a>>;

/// Transfers a single part.
pub trait ChunkWorker: Send + Sync {
    /// Moves `part`'s bytes once. Returns [`ClassifiedError::Aborted`] if
    /// `cancel` fires before the part is finished.
    fn transfer<'a>(&'a self, part: &'a Part, cancel: &'a CancellationToken) -> PartFuture<'a>;
}

/// Payload of an upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
}

impl UploadSource {
    /// Total payload size in bytes.
    pub async fn len(&self) -> std::io::Result<u64> {
        match self {
            UploadSource::Memory(data) => Ok(data.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// File-backed sources can be reopened after a restart.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            UploadSource::Memory(_) => None,
            UploadSource::File(path) => Some(path),
        }
    }

    async fn read_range(&self, part: &Part) -> Result<Vec<u8>, ClassifiedError> {
        let range = part.range;
        match self {
            UploadSource::Memory(data) => data
                .get(range.start as usize..range.end as usize)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    ClassifiedError::Fatal(format!(
                        "range {}..{} outside payload of {} bytes",
                        range.start,
                        range.end,
                        data.len()
                    ))
                }),
            UploadSource::File(path) => {
                let read = async {
                    let mut file = tokio::fs::File::open(path).await?;
                    file.seek(SeekFrom::Start(range.start)).await?;
                    let mut buf = vec![0u8; range.len() as usize];
                    file.read_exact(&mut buf).await?;
                    Ok::<_, std::io::Error>(buf)
                };
                read.await.map_err(|e| {
                    ClassifiedError::Fatal(format!("read {}: {e}", path.display()))
                })
            }
        }
    }
}

/// Streams one byte range into `<temp_dir>/part-NNNNN`.
pub struct DownloadWorker {
    client: Arc<dyn StorageClient>,
    key: String,
    temp_dir: PathBuf,
}

impl DownloadWorker {
    pub fn new(client: Arc<dyn StorageClient>, key: String, temp_dir: PathBuf) -> Self {
        Self {
            client,
            key,
            temp_dir,
        }
    }

    /// Temp file that holds part `index`.
    pub fn part_path(&self, index: usize) -> PathBuf {
        self.temp_dir.join(format!("part-{index:05}"))
    }

    async fn fetch(&self, part: &Part) -> Result<PartOutcome, ClassifiedError> {
        let path = self.part_path(part.index);
        let expected = part.range.len();

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| ClassifiedError::Fatal(format!("create part dir: {e}")))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ClassifiedError::Fatal(format!("create {}: {e}", path.display())))?;

        let mut written = 0u64;
        if !part.range.is_empty() {
            let mut body = self
                .client
                .range_get(&self.key, part.range.as_range())
                .await?;
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = body
                    .read(&mut buf)
                    .await
                    .map_err(|e| ClassifiedError::from(StorageError::Io(e)))?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| ClassifiedError::Fatal(format!("write {}: {e}", path.display())))?;
                written += n as u64;
            }
        }
        file.flush()
            .await
            .map_err(|e| ClassifiedError::Fatal(format!("flush {}: {e}", path.display())))?;

        if written != expected {
            return Err(ClassifiedError::SizeMismatch {
                expected,
                actual: written,
            });
        }
        trace!(part = part.index, bytes = written, "part written");
        Ok(PartOutcome {
            bytes: written,
            temp_location: Some(path),
            part_id: None,
        })
    }
}

impl ChunkWorker for DownloadWorker {
    fn transfer<'a>(&'a self, part: &'a Part, cancel: &'a CancellationToken) -> PartFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClassifiedError::Aborted),
                result = self.fetch(part) => result,
            }
        })
    }
}

/// Uploads one part of a multipart upload.
pub struct UploadWorker {
    client: Arc<dyn StorageClient>,
    key: String,
    upload_id: String,
    source: UploadSource,
    credentials: Option<CredentialBinding>,
}

impl UploadWorker {
    pub fn new(
        client: Arc<dyn StorageClient>,
        key: String,
        upload_id: String,
        source: UploadSource,
        credentials: Option<CredentialBinding>,
    ) -> Self {
        Self {
            client,
            key,
            upload_id,
            source,
            credentials,
        }
    }

    async fn send(&self, part: &Part) -> Result<PartOutcome, ClassifiedError> {
        let body = self.source.read_range(part).await?;
        let bytes = body.len() as u64;
        if bytes != part.range.len() {
            return Err(ClassifiedError::SizeMismatch {
                expected: part.range.len(),
                actual: bytes,
            });
        }

        let creds = match &self.credentials {
            Some(binding) => Some(binding.get(false).await?),
            None => None,
        };
        let etag = self
            .client
            .put_part(
                &self.key,
                &self.upload_id,
                part.part_number(),
                body,
                creds.as_ref(),
            )
            .await?;
        trace!(part = part.index, bytes, %etag, "part uploaded");
        Ok(PartOutcome {
            bytes,
            temp_location: None,
            part_id: Some(etag),
        })
    }
}

impl ChunkWorker for UploadWorker {
    fn transfer<'a>(&'a self, part: &'a Part, cancel: &'a CancellationToken) -> PartFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClassifiedError::Aborted),
                result = self.send(part) => result,
            }
        })
    }
}
