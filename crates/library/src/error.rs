//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Store failures are wrapped, not
//! replaced: the storage kind is carried along so callers can still build a
//! user-facing message from it.

use crate::message::Operation;
use derive_more::{Display, Error};
use songbook_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A store operation failed.
    #[display("unable to {op} `{path}`: {kind}")]
    Store {
        #[error(not(source))]
        op: Operation,
        #[error(not(source))]
        path: String,
        #[error(not(source))]
        kind: StorageErrorKind,
    },
    /// A newer request was issued before this one finished.
    #[display("superseded by a newer request")]
    Superseded,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { kind, .. } => kind.is_retryable(),
            Self::Superseded => false,
        }
    }

    /// The storage failure underneath, if there is one.
    pub fn storage_kind(&self) -> Option<&StorageErrorKind> {
        match self {
            Self::Store { kind, .. } => Some(kind),
            Self::Superseded => None,
        }
    }
}

/// Wrap a store failure with the operation and path it belongs to.
#[track_caller]
pub(crate) fn store_error(op: Operation, path: &str, err: StorageError) -> Error {
    let kind = ErrorKind::Store { op, path: path.to_string(), kind: (*err).clone() };
    err.raise(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_keeps_storage_kind() {
        let err = store_error(Operation::Save, "/a", exn::Exn::from(StorageErrorKind::Network("reset".into())));
        assert!(err.is_retryable());
        assert!(matches!(err.storage_kind(), Some(StorageErrorKind::Network(_))));
        assert_eq!((*err).to_string(), "unable to save `/a`: network error: reset");
    }
}
