//! Object-storage client contract for the partwise transfer engine.
//!
//! The engine never speaks a storage wire protocol itself. It drives
//! whatever implements [`StorageClient`] (range reads, multipart part
//! uploads, completion) and asks a [`CredentialProvider`] for temporary
//! credentials when the upload side needs them.
//!
//! [`memory::MemoryStore`] is an in-process backend with call
//! instrumentation and fault injection, used by local runs and tests.

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{ByteStream, CredentialProvider, StorageClient, StorageFuture};
pub use error::{ErrorClass, StorageError};
pub use memory::{MemoryStore, Operation};
pub use types::{CompletedPart, Credentials, ObjectMeta};
