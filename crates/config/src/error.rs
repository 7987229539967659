//! Config Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration file `{_0}` does not exist")]
    MissingFile(#[error(not(source))] String),
    #[display("unsupported configuration file format `{_0}` (expected toml, yaml or json)")]
    UnsupportedFormat(#[error(not(source))] String),
    /// A source could not be read or did not match the expected shape.
    #[display("unable to load configuration")]
    Load,
    /// A value was read but makes no sense.
    #[display("invalid configuration value for `{key}`: {reason}")]
    Invalid {
        #[error(not(source))]
        key: &'static str,
        #[error(not(source))]
        reason: String,
    },
}

impl ErrorKind {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { key, reason: reason.into() }
    }
}
