//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. When the cache acts as a
//! [`FileStore`](songbook_storage::FileStore), every kind converts into the
//! storage taxonomy (see [`ErrorKind::to_storage`]).

use derive_more::{Display, Error};
use songbook_storage::error::ErrorKind as StorageErrorKind;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Nothing is cached at this path. Expected; the network path takes over.
    #[display("cache miss: {_0}")]
    Miss(#[error(not(source))] String),
    /// The cached tree disagrees with the request, e.g. a parent is a file.
    #[display("conflict: {_0}")]
    Conflict(#[error(not(source))] String),
    #[display("invalid path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    #[display("bad request: {_0}")]
    BadRequest(#[error(not(source))] String),
    /// A stored row could not be decoded (or encoded).
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss(_))
    }

    /// The storage error kind a file-store caller should see.
    pub fn to_storage(&self) -> StorageErrorKind {
        match self {
            Self::Miss(path) => StorageErrorKind::NotFound(path.clone()),
            Self::Conflict(reason) => StorageErrorKind::Conflict(reason.clone()),
            Self::InvalidPath(path) => StorageErrorKind::InvalidPath(path.clone()),
            Self::BadRequest(reason) => StorageErrorKind::BadRequest(reason.clone()),
            Self::Database | Self::Migration | Self::InvalidData(_) => StorageErrorKind::Cache(self.to_string()),
        }
    }
}

/// Re-raise a cache error as a storage error, keeping the cache frame as a
/// child in the error tree.
#[track_caller]
pub(crate) fn into_storage(err: Error) -> songbook_storage::error::Error {
    let kind = err.to_storage();
    err.raise(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Miss("/a".into()), Some(404))]
    #[case(ErrorKind::Conflict("/a is a file".into()), Some(409))]
    #[case(ErrorKind::BadRequest("no".into()), Some(400))]
    #[case(ErrorKind::Database, Some(500))]
    fn test_storage_status(#[case] kind: ErrorKind, #[case] status: Option<u16>) {
        assert_eq!(kind.to_storage().status(), status);
    }

    #[test]
    fn test_miss_is_not_found() {
        let err = into_storage(exn::Exn::from(ErrorKind::Miss("/a".into())));
        assert!(err.is_not_found());
    }
}
