//! Storage error types and their retry classification.

use std::io::ErrorKind;

/// How the transfer engine should react to a failed storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: network hiccup, timeout, throttling, 5xx.
    Retryable,
    /// Permanent for this request: bad request, not found, denied.
    Fatal,
    /// The temporary credentials used for the call have expired.
    CredentialExpired,
}

/// Errors returned by a [`StorageClient`](crate::StorageClient).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request throttled")]
    Throttled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("credentials expired")]
    CredentialsExpired,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const RETRYABLE_IO_KINDS: &[ErrorKind] = &[
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionAborted,
    ErrorKind::ConnectionRefused,
    ErrorKind::BrokenPipe,
    ErrorKind::TimedOut,
    ErrorKind::UnexpectedEof,
    ErrorKind::Interrupted,
];

impl StorageError {
    /// Classifies the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Timeout | StorageError::Connection(_) | StorageError::Throttled => {
                ErrorClass::Retryable
            }
            StorageError::Server { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            StorageError::CredentialsExpired => ErrorClass::CredentialExpired,
            StorageError::Io(e) if RETRYABLE_IO_KINDS.contains(&e.kind()) => ErrorClass::Retryable,
            StorageError::Unauthorized(_)
            | StorageError::NotFound(_)
            | StorageError::InvalidRequest(_)
            | StorageError::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StorageError::Timeout.is_retryable());
        assert!(StorageError::Throttled.is_retryable());
        assert!(StorageError::Connection("reset".into()).is_retryable());
        assert!(
            StorageError::Server {
                status: 503,
                message: "slow down".into()
            }
            .is_retryable()
        );
        assert!(
            StorageError::Server {
                status: 429,
                message: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn client_errors_are_fatal() {
        assert_eq!(
            StorageError::Server {
                status: 400,
                message: "bad".into()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(StorageError::NotFound("k".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            StorageError::Unauthorized("denied".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            StorageError::InvalidRequest("range".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn expired_credentials_have_own_class() {
        assert_eq!(
            StorageError::CredentialsExpired.class(),
            ErrorClass::CredentialExpired
        );
    }

    #[test]
    fn io_kinds_split_between_classes() {
        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert!(StorageError::from(reset).is_retryable());

        let eof = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert!(StorageError::from(eof).is_retryable());

        let denied = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert_eq!(StorageError::from(denied).class(), ErrorClass::Fatal);

        let other = std::io::Error::other("weird");
        assert_eq!(StorageError::from(other).class(), ErrorClass::Fatal);
    }
}
