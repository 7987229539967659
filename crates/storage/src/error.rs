//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every backend (and the offline cache,
//! when it acts as a file store) reports failures with these kinds, so callers
//! can decide between "create it fresh", "retry" and "tell the user" without
//! knowing which backend produced them.

use derive_more::{Display, Error};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// The kind is `Clone` so that a single failed token refresh can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Target path does not exist (remotely or in the cache).
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Path is malformed or escapes the store root.
    #[display("invalid path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// Malformed request, missing field, or an operation that makes no sense.
    #[display("bad request: {_0}")]
    BadRequest(#[error(not(source))] String),
    /// Structural problem, e.g. a path expected to be a folder is a file.
    #[display("conflict: {_0}")]
    Conflict(#[error(not(source))] String),
    /// Expired or invalid credentials.
    #[display("unauthorized: {_0}")]
    Unauthorized(#[error(not(source))] String),
    /// Connectivity failure; nothing reached the backend.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Opaque backend failure.
    #[display("server error ({status}): {message}")]
    Server {
        #[error(not(source))]
        status: u16,
        #[error(not(source))]
        message: String,
    },
    /// The backend cannot perform this operation at all.
    #[display("unsupported operation: {_0}")]
    Unsupported(#[error(not(source))] &'static str),
    /// A response or stored record could not be decoded.
    #[display("invalid data: {_0}")]
    InvalidData(#[error(not(source))] String),
    /// Local I/O failure.
    #[display("I/O error: {_0}")]
    Io(#[error(not(source))] String),
    /// The offline cache failed for a reason other than a miss.
    #[display("cache error: {_0}")]
    Cache(#[error(not(source))] String),
}

impl ErrorKind {
    /// HTTP-like status for this error, if one applies.
    ///
    /// Network failures never reached a server, so they have no status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::InvalidPath(_) | Self::BadRequest(_) => Some(400),
            Self::Conflict(_) => Some(409),
            Self::Unauthorized(_) => Some(401),
            Self::Unsupported(_) => Some(501),
            Self::Server { status, .. } => Some(*status),
            Self::InvalidData(_) | Self::Io(_) | Self::Cache(_) => Some(500),
            Self::Network(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Io(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Human-readable message suitable for showing to an end user.
    ///
    /// Server-side details are never included.
    pub fn user_message(&self, backend: &str) -> String {
        match self {
            Self::Server { status, .. } if *status >= 500 => {
                format!("{backend} seems to be down at the moment. Try again later?")
            },
            Self::Network(_) => "Unable to connect to the internet. Try again?".to_string(),
            Self::NotFound(path) => format!("Could not find `{path}`."),
            Self::Unauthorized(_) => format!("Your {backend} session has expired. Try logging in again?"),
            Self::Unsupported(what) => format!("{backend} does not support {what}."),
            Self::Conflict(reason) | Self::BadRequest(reason) => format!("{reason}."),
            _ => format!("There was an error with {backend}. Try refreshing?"),
        }
    }
}

/// Log a failed read from the offline cache.
///
/// Misses are expected (the network path takes over) and logged quietly;
/// anything else means the cache itself is misbehaving.
pub fn log_cache_error(err: &Error) {
    if err.is_not_found() {
        tracing::debug!(error = %err.to_string_lossy(), "Cache miss");
    } else {
        tracing::error!(error = ?err, "Failed to read from the offline cache");
    }
}

/// Rendering helpers for errors as seen by logs.
pub trait ErrorDisplayExt {
    /// The top-level error kind rendered as a string.
    fn to_string_lossy(&self) -> String;
}
impl ErrorDisplayExt for Error {
    fn to_string_lossy(&self) -> String {
        let kind: &ErrorKind = self;
        kind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::NotFound("/a".into()), Some(404))]
    #[case(ErrorKind::InvalidPath("/../a".into()), Some(400))]
    #[case(ErrorKind::Conflict("/a is a file".into()), Some(409))]
    #[case(ErrorKind::Unauthorized("expired".into()), Some(401))]
    #[case(ErrorKind::Server { status: 503, message: "down".into() }, Some(503))]
    #[case(ErrorKind::Network("refused".into()), None)]
    fn test_status(#[case] kind: ErrorKind, #[case] expected: Option<u16>) {
        assert_eq!(kind.status(), expected);
    }

    #[test]
    fn test_is_not_found_through_exn() {
        let err: Error = exn::Exn::from(ErrorKind::NotFound("/Songs/a.chopro".into()));
        assert!(err.is_not_found());
        let err: Error = exn::Exn::from(ErrorKind::Conflict("nope".into()));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_user_messages() {
        let down = ErrorKind::Server { status: 502, message: "bad gateway".into() };
        assert_eq!(down.user_message("Dropbox"), "Dropbox seems to be down at the moment. Try again later?");
        let offline = ErrorKind::Network("dns".into());
        assert_eq!(offline.user_message("Dropbox"), "Unable to connect to the internet. Try again?");
        let other = ErrorKind::InvalidData("garbage".into());
        assert_eq!(other.user_message("S3"), "There was an error with S3. Try refreshing?");
        // Internal details never leak into the user message.
        assert!(!down.user_message("Dropbox").contains("bad gateway"));
    }

    #[rstest]
    #[case(ErrorKind::Network("reset".into()), true)]
    #[case(ErrorKind::Server { status: 500, message: String::new() }, true)]
    #[case(ErrorKind::Server { status: 404, message: String::new() }, false)]
    #[case(ErrorKind::Conflict(String::new()), false)]
    fn test_is_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }
}
