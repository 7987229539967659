//! Messages shown to the user when an operation fails.

use crate::error::ErrorKind;
use derive_more::Display;
use songbook_storage::error::ErrorKind as StorageErrorKind;

/// The user-visible name of a file-store operation.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    #[display("save")]
    Save,
    #[display("load")]
    Load,
    #[display("list")]
    List,
    #[display("move")]
    Move,
    #[display("create")]
    Create,
    #[display("compress")]
    Compress,
    #[display("delete")]
    Delete,
}

/// "Unable to save `/path`. <what the user can do about it>"
pub fn failure_message(op: Operation, path: &str, err: &StorageErrorKind, backend: &str) -> String {
    format!("Unable to {op} `{path}`. {}", err.user_message(backend))
}

/// [`failure_message`] for a library error, or `None` when there is nothing
/// to tell the user (a superseded request).
pub fn describe(err: &ErrorKind, backend: &str) -> Option<String> {
    match err {
        ErrorKind::Store { op, path, kind } => Some(failure_message(*op, path, kind, backend)),
        ErrorKind::Superseded => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Operation::Save, StorageErrorKind::Network("dns".into()), "Unable to save `/Songs/a.chopro`. Unable to connect to the internet. Try again?")]
    #[case(Operation::Load, StorageErrorKind::Server { status: 503, message: "stack trace".into() }, "Unable to load `/Songs/a.chopro`. Dropbox seems to be down at the moment. Try again later?")]
    #[case(Operation::Delete, StorageErrorKind::Io("EACCES".into()), "Unable to delete `/Songs/a.chopro`. There was an error with Dropbox. Try refreshing?")]
    fn test_failure_message(#[case] op: Operation, #[case] kind: StorageErrorKind, #[case] expected: &str) {
        assert_eq!(failure_message(op, "/Songs/a.chopro", &kind, "Dropbox"), expected);
    }

    #[test]
    fn test_superseded_is_silent() {
        assert_eq!(describe(&ErrorKind::Superseded, "Dropbox"), None);
    }
}
