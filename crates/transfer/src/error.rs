//! Error types for the transfer engine.

use serde::{Deserialize, Serialize};

use partwise_storage::{ErrorClass, StorageError};

use crate::types::{PartStatus, SessionState};

/// Outcome of a single failed part attempt, classified for retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum ClassifiedError {
    /// Transient failure; worth another attempt after backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; retrying the same request cannot succeed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Temporary credentials expired; needs a refresh, not a retry.
    #[error("credentials expired: {0}")]
    CredentialExpired(String),

    /// The part transferred a different number of bytes than its range.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Interrupted by pause or cancel.
    #[error("aborted")]
    Aborted,
}

impl ClassifiedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifiedError::Retryable(_))
    }

    pub fn is_credential_expired(&self) -> bool {
        matches!(self, ClassifiedError::CredentialExpired(_))
    }
}

impl From<StorageError> for ClassifiedError {
    fn from(err: StorageError) -> Self {
        match err.class() {
            ErrorClass::Retryable => ClassifiedError::Retryable(err.to_string()),
            ErrorClass::Fatal => ClassifiedError::Fatal(err.to_string()),
            ErrorClass::CredentialExpired => ClassifiedError::CredentialExpired(err.to_string()),
        }
    }
}

/// Errors produced while merging downloaded parts.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("part {index} is {status:?}, expected Done")]
    IncompletePart { index: usize, status: PartStatus },

    #[error("verification failed: expected {expected} bytes, found {actual}")]
    VerificationFailed { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("cannot {op} a session in state {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("transfer aborted")]
    Aborted,

    #[error("part {part_index} failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        part_index: usize,
        attempts: u32,
        last_error: ClassifiedError,
    },

    #[error("part {part_index} failed on attempt {attempts}: {error}")]
    PartFailed {
        part_index: usize,
        attempts: u32,
        error: ClassifiedError,
    },

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("upload failed after {attempts} credential refresh(es): {last_error}")]
    ReuploadFailed {
        attempts: u32,
        last_error: ClassifiedError,
    },

    #[error("credential fetch failed: {0}")]
    Credentials(ClassifiedError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl TransferError {
    /// Returns `true` if a part failed because its credentials expired.
    pub fn is_credential_expired(&self) -> bool {
        matches!(
            self,
            TransferError::PartFailed { error, .. } if error.is_credential_expired()
        )
    }

    /// The classified cause of a part-level failure, if any.
    pub fn part_error(&self) -> Option<&ClassifiedError> {
        match self {
            TransferError::PartFailed { error, .. } => Some(error),
            TransferError::RetryExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Checkpoint(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_classes() {
        assert!(ClassifiedError::from(StorageError::Timeout).is_retryable());
        assert!(matches!(
            ClassifiedError::from(StorageError::NotFound("k".into())),
            ClassifiedError::Fatal(_)
        ));
        assert!(ClassifiedError::from(StorageError::CredentialsExpired).is_credential_expired());
    }

    #[test]
    fn aborted_and_size_mismatch_are_not_retryable() {
        assert!(!ClassifiedError::Aborted.is_retryable());
        assert!(
            !ClassifiedError::SizeMismatch {
                expected: 10,
                actual: 9
            }
            .is_retryable()
        );
    }

    #[test]
    fn credential_expiry_detected_on_part_failure() {
        let err = TransferError::PartFailed {
            part_index: 2,
            attempts: 1,
            error: ClassifiedError::CredentialExpired("token".into()),
        };
        assert!(err.is_credential_expired());

        let exhausted = TransferError::RetryExhausted {
            part_index: 2,
            attempts: 3,
            last_error: ClassifiedError::Retryable("timeout".into()),
        };
        assert!(!exhausted.is_credential_expired());
        assert!(exhausted.part_error().unwrap().is_retryable());
    }

    #[test]
    fn classified_error_serializes_tagged() {
        let json = serde_json::to_string(&ClassifiedError::Retryable("503".into())).unwrap();
        assert_eq!(json, r#"{"kind":"retryable","detail":"503"}"#);

        let json = serde_json::to_string(&ClassifiedError::Aborted).unwrap();
        assert_eq!(json, r#"{"kind":"aborted"}"#);
    }
}
