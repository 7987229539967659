//! Server Error Types
//!
//! Errors of the server process itself (binding, serving). Failures of
//! individual requests never surface here; they become HTTP responses, see
//! [`ApiError`](crate::ApiError).

use derive_more::{Display, Error};

/// A server error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("unable to listen on {_0}")]
    Bind(#[error(not(source))] String),
    #[display("server stopped unexpectedly")]
    Serve,
}
