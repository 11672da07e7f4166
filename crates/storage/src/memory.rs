//! In-memory storage backend.
//!
//! Objects and unfinished multipart uploads live in process memory.
//! Every call is recorded and the number of concurrently running calls
//! is tracked, so callers can assert on request counts and concurrency.
//! Failures can be injected with a fault hook, and selected calls can be
//! parked until [`MemoryStore::release`] is called.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::trace;

use crate::client::{ByteStream, StorageClient, StorageFuture};
use crate::error::StorageError;
use crate::types::{CompletedPart, Credentials, ObjectMeta};

/// A storage call as seen by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Head {
        key: String,
    },
    RangeGet {
        key: String,
        start: u64,
        end: u64,
    },
    CreateMultipart {
        key: String,
    },
    PutPart {
        key: String,
        upload_id: String,
        part_number: u32,
    },
    CompleteMultipart {
        key: String,
        upload_id: String,
    },
    AbortMultipart {
        key: String,
        upload_id: String,
    },
}

type FaultHook = Box<dyn Fn(&Operation) -> Option<StorageError> + Send + Sync>;
type HoldPredicate = Box<dyn Fn(&Operation) -> bool + Send + Sync>;

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (Vec<u8>, String)>,
}

/// In-memory [`StorageClient`] with call instrumentation.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    calls: Mutex<Vec<Operation>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    latency: RwLock<Duration>,
    fault: RwLock<Option<FaultHook>>,
    hold: RwLock<Option<HoldPredicate>>,
    released: watch::Sender<bool>,
    require_credentials: AtomicBool,
    revoked: RwLock<HashSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active-call gauge when the call finishes or is dropped.
struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (released, _) = watch::channel(true);
        Self {
            objects: RwLock::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            latency: RwLock::new(Duration::ZERO),
            fault: RwLock::new(None),
            hold: RwLock::new(None),
            released,
            require_credentials: AtomicBool::new(false),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Stores an object directly, bypassing the upload path.
    pub fn put_object(&self, key: &str, data: Vec<u8>) {
        self.objects.write().unwrap().insert(key.to_string(), data);
    }

    /// Returns a copy of a stored object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    /// Adds a fixed delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap() = latency;
    }

    /// Installs a hook that may fail any call with the returned error.
    pub fn set_fault_hook<F>(&self, hook: F)
    where
        F: Fn(&Operation) -> Option<StorageError> + Send + Sync + 'static,
    {
        *self.fault.write().unwrap() = Some(Box::new(hook));
    }

    /// Removes the fault hook.
    pub fn clear_fault_hook(&self) {
        *self.fault.write().unwrap() = None;
    }

    /// Parks every call matching `predicate` until [`release`](Self::release).
    pub fn hold_where<F>(&self, predicate: F)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.released.send_replace(false);
        *self.hold.write().unwrap() = Some(Box::new(predicate));
    }

    /// Lets parked calls proceed and stops parking new ones.
    pub fn release(&self) {
        *self.hold.write().unwrap() = None;
        self.released.send_replace(true);
    }

    /// Rejects upload calls that carry no credentials or revoked ones.
    pub fn require_credentials(&self, required: bool) {
        self.require_credentials.store(required, Ordering::SeqCst);
    }

    /// Marks a session token as expired for all later calls.
    pub fn revoke_token(&self, session_token: &str) {
        self.revoked
            .write()
            .unwrap()
            .insert(session_token.to_string());
    }

    /// Returns every call made so far, in arrival order.
    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of range reads that started at `start`.
    pub fn range_get_count(&self, start: u64) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, Operation::RangeGet { start: s, .. } if *s == start))
            .count()
    }

    /// Number of uploads of part `part_number`.
    pub fn put_part_count(&self, part_number: u32) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| {
                matches!(op, Operation::PutPart { part_number: n, .. } if *n == part_number)
            })
            .count()
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    /// Records the call, waits out holds and latency, then applies faults.
    async fn enter(&self, op: Operation) -> Result<ActiveGuard<'_>, StorageError> {
        trace!(?op, "memory store call");
        self.calls.lock().unwrap().push(op.clone());
        let guard = ActiveGuard::enter(&self.active, &self.peak);

        let held = self.hold.read().unwrap().as_ref().is_some_and(|p| p(&op));
        if held {
            let mut rx = self.released.subscribe();
            // The sender lives as long as `self`.
            let _ = rx.wait_for(|released| *released).await;
        }

        let latency = *self.latency.read().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = self.fault.read().unwrap().as_ref().and_then(|f| f(&op));
        if let Some(err) = fault {
            return Err(err);
        }
        Ok(guard)
    }

    fn check_credentials(&self, credentials: Option<&Credentials>) -> Result<(), StorageError> {
        if !self.require_credentials.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(creds) = credentials else {
            return Err(StorageError::Unauthorized("missing credentials".into()));
        };
        let revoked = self.revoked.read().unwrap().contains(&creds.session_token);
        if revoked || creds.expire <= Utc::now() {
            return Err(StorageError::CredentialsExpired);
        }
        Ok(())
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..16])
}

impl StorageClient for MemoryStore {
    fn head<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::Head {
                    key: key.to_string(),
                })
                .await?;
            let objects = self.objects.read().unwrap();
            let data = objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Ok(ObjectMeta {
                size: data.len() as u64,
                etag: etag_of(data),
            })
        })
    }

    fn range_get<'a>(&'a self, key: &'a str, range: Range<u64>) -> StorageFuture<'a, ByteStream> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::RangeGet {
                    key: key.to_string(),
                    start: range.start,
                    end: range.end,
                })
                .await?;
            let objects = self.objects.read().unwrap();
            let data = objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            if range.start > range.end || range.end > data.len() as u64 {
                return Err(StorageError::InvalidRequest(format!(
                    "range {}..{} outside object of {} bytes",
                    range.start,
                    range.end,
                    data.len()
                )));
            }
            let slice = data[range.start as usize..range.end as usize].to_vec();
            let stream: ByteStream = Box::new(std::io::Cursor::new(slice));
            Ok(stream)
        })
    }

    fn create_multipart<'a>(
        &'a self,
        key: &'a str,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, String> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::CreateMultipart {
                    key: key.to_string(),
                })
                .await?;
            self.check_credentials(credentials)?;
            let upload_id = uuid::Uuid::new_v4().to_string();
            self.uploads.lock().unwrap().insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn put_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, String> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::PutPart {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    part_number,
                })
                .await?;
            self.check_credentials(credentials)?;
            if part_number == 0 {
                return Err(StorageError::InvalidRequest("part numbers start at 1".into()));
            }
            let mut uploads = self.uploads.lock().unwrap();
            let upload = uploads
                .get_mut(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;
            let etag = etag_of(&body);
            upload.parts.insert(part_number, (body, etag.clone()));
            Ok(etag)
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::CompleteMultipart {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                })
                .await?;
            self.check_credentials(credentials)?;

            let mut uploads = self.uploads.lock().unwrap();
            let upload = uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

            let mut data = Vec::new();
            for (expected, part) in (1u32..).zip(parts) {
                if part.part_number != expected {
                    return Err(StorageError::InvalidRequest(format!(
                        "part list not contiguous at {}",
                        part.part_number
                    )));
                }
                let (body, etag) = upload.parts.get(&part.part_number).ok_or_else(|| {
                    StorageError::InvalidRequest(format!(
                        "part {} never uploaded",
                        part.part_number
                    ))
                })?;
                if *etag != part.etag {
                    return Err(StorageError::InvalidRequest(format!(
                        "etag mismatch for part {}",
                        part.part_number
                    )));
                }
                data.extend_from_slice(body);
            }
            uploads.remove(upload_id);

            let meta = ObjectMeta {
                size: data.len() as u64,
                etag: etag_of(&data),
            };
            self.objects.write().unwrap().insert(key.to_string(), data);
            Ok(meta)
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self
                .enter(Operation::AbortMultipart {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                })
                .await?;
            self.check_credentials(credentials)?;
            self.uploads.lock().unwrap().remove(upload_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn creds(token: &str) -> Credentials {
        Credentials {
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            session_token: token.into(),
            expire: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn head_and_range_get() {
        let store = MemoryStore::new();
        store.put_object("obj", b"0123456789".to_vec());

        let meta = store.head("obj").await.unwrap();
        assert_eq!(meta.size, 10);
        assert!(!meta.etag.is_empty());

        let body = read_all(store.range_get("obj", 2..6).await.unwrap()).await;
        assert_eq!(&body, b"2345");
        assert_eq!(store.range_get_count(2), 1);
    }

    #[tokio::test]
    async fn range_outside_object_is_rejected() {
        let store = MemoryStore::new();
        store.put_object("obj", b"abc".to_vec());
        let err = store.range_get("obj", 1..10).await.err().unwrap();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryStore::new();
        let err = store.head("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn multipart_assembles_in_part_order() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart("dst", None).await.unwrap();

        let e2 = store
            .put_part("dst", &upload_id, 2, b"World".to_vec(), None)
            .await
            .unwrap();
        let e1 = store
            .put_part("dst", &upload_id, 1, b"Hello ".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(store.pending_uploads(), 1);

        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: e1,
            },
            CompletedPart {
                part_number: 2,
                etag: e2,
            },
        ];
        let meta = store
            .complete_multipart("dst", &upload_id, &parts, None)
            .await
            .unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(store.object("dst").unwrap(), b"Hello World");
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn complete_rejects_gap_in_parts() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart("dst", None).await.unwrap();
        let e2 = store
            .put_part("dst", &upload_id, 2, b"x".to_vec(), None)
            .await
            .unwrap();
        let parts = vec![CompletedPart {
            part_number: 2,
            etag: e2,
        }];
        let err = store
            .complete_multipart("dst", &upload_id, &parts, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn abort_discards_upload() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart("dst", None).await.unwrap();
        store.abort_multipart("dst", &upload_id, None).await.unwrap();
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn fault_hook_fails_matching_calls() {
        let store = MemoryStore::new();
        store.put_object("obj", vec![0; 8]);
        store.set_fault_hook(|op| match op {
            Operation::RangeGet { start: 4, .. } => Some(StorageError::Timeout),
            _ => None,
        });

        assert!(store.range_get("obj", 0..4).await.is_ok());
        let err = store.range_get("obj", 4..8).await.err().unwrap();
        assert!(matches!(err, StorageError::Timeout));

        store.clear_fault_hook();
        assert!(store.range_get("obj", 4..8).await.is_ok());
    }

    #[tokio::test]
    async fn credentials_enforced_when_required() {
        let store = MemoryStore::new();
        store.require_credentials(true);

        let err = store.create_multipart("dst", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));

        let good = creds("t1");
        let upload_id = store.create_multipart("dst", Some(&good)).await.unwrap();

        store.revoke_token("t1");
        let err = store
            .put_part("dst", &upload_id, 1, b"x".to_vec(), Some(&good))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CredentialsExpired));

        let fresh = creds("t2");
        assert!(
            store
                .put_part("dst", &upload_id, 1, b"x".to_vec(), Some(&fresh))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn held_calls_wait_for_release() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("obj", vec![1; 4]);
        store.hold_where(|op| matches!(op, Operation::RangeGet { .. }));

        let s = Arc::clone(&store);
        let task = tokio::spawn(async move { s.range_get("obj", 0..4).await.is_ok() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        store.release();
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_call_leaves_gauge_clean() {
        let store = MemoryStore::new();
        store.put_object("obj", vec![1; 4]);
        store.hold_where(|_| true);

        let fut = store.range_get("obj", 0..4);
        let res = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(res.is_err());
        assert_eq!(store.active.load(Ordering::SeqCst), 0);
        assert_eq!(store.peak_concurrency(), 1);
    }
}
