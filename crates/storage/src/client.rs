//! Storage client and credential provider traits.
//!
//! Implemented by the application on top of its object-storage SDK.
//! Using traits keeps the transfer engine decoupled from any wire
//! protocol and testable with [`MemoryStore`](crate::MemoryStore).

use std::future::Future;
use std::ops::Range;
use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::error::StorageError;
use crate::types::{CompletedPart, Credentials, ObjectMeta};

/// Response body of a range read.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed future returned by every storage call.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Narrow view of an object-storage service.
///
/// Every returned future must be safe to drop mid-flight: the engine
/// interrupts in-flight calls on pause or cancel by dropping them.
pub trait StorageClient: Send + Sync {
    /// Returns the size and ETag of `key`.
    fn head<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ObjectMeta>;

    /// Reads bytes `range.start..range.end` (end exclusive) of `key`.
    fn range_get<'a>(&'a self, key: &'a str, range: Range<u64>) -> StorageFuture<'a, ByteStream>;

    /// Starts a multipart upload and returns its upload ID.
    fn create_multipart<'a>(
        &'a self,
        key: &'a str,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, String>;

    /// Uploads one part and returns its ETag.
    fn put_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, String>;

    /// Assembles the uploaded parts into the final object.
    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, ObjectMeta>;

    /// Discards an unfinished multipart upload and its parts.
    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        credentials: Option<&'a Credentials>,
    ) -> StorageFuture<'a, ()>;
}

/// Issues temporary credentials for a storage endpoint (STS-style).
pub trait CredentialProvider: Send + Sync {
    fn fetch<'a>(&'a self, endpoint: &'a str) -> StorageFuture<'a, Credentials>;
}
