//! Dropbox API v2 payloads and their normalization into the metadata model.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, FileMetadata, FolderMetadata};
use crate::path::canonicalize;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Deserialize)]
pub struct DropboxFile {
    pub name: String,
    pub id: String,
    pub path_display: Option<String>,
    pub path_lower: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub client_modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub server_modified: OffsetDateTime,
    pub rev: String,
    pub size: u64,
    pub is_downloadable: Option<bool>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropboxFolder {
    pub name: String,
    pub id: String,
    pub path_display: Option<String>,
    pub path_lower: Option<String>,
}

/// A tagged entry as returned by listing, move and delete.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum DropboxEntry {
    File(DropboxFile),
    Folder(DropboxFolder),
    /// `deleted` entries, and anything newer than this client.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ListFolderResult {
    pub entries: Vec<DropboxEntry>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct EntryResult {
    pub metadata: DropboxEntry,
}

#[derive(Debug, Deserialize)]
pub struct FolderResult {
    pub metadata: DropboxFolder,
}

#[derive(Debug, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error_summary: String,
}

/// Upload write mode, as a tagged union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum WriteMode {
    Add,
    Overwrite,
    Update { update: String },
}

#[derive(Debug, Serialize)]
pub struct UploadArg<'a> {
    pub path: &'a str,
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
}

#[derive(Debug, Serialize)]
pub struct PathArg<'a> {
    pub path: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CursorArg<'a> {
    pub cursor: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RelocationArg<'a> {
    pub from_path: &'a str,
    pub to_path: &'a str,
    pub autorename: bool,
}

fn display_path(display: Option<String>, lower: Option<String>, name: &str) -> Result<String> {
    match display.or(lower) {
        Some(path) => canonicalize(&path),
        // Entries outside the app folder can come back without a path.
        None => exn::bail!(ErrorKind::InvalidData(format!("Dropbox entry `{name}` has no path"))),
    }
}

impl TryFrom<DropboxFile> for FileMetadata {
    type Error = crate::error::Error;

    fn try_from(file: DropboxFile) -> Result<Self> {
        let path = display_path(file.path_display, file.path_lower, &file.name)?;
        Ok(Self {
            name: file.name,
            path,
            id: file.id,
            client_modified: file.client_modified,
            server_modified: file.server_modified,
            rev: file.rev,
            size: file.size,
            is_downloadable: file.is_downloadable.unwrap_or(false),
            hash: file.content_hash.unwrap_or_default(),
        })
    }
}

impl TryFrom<DropboxFolder> for FolderMetadata {
    type Error = crate::error::Error;

    fn try_from(folder: DropboxFolder) -> Result<Self> {
        let path = display_path(folder.path_display, folder.path_lower, &folder.name)?;
        Ok(Self { name: folder.name, path, id: folder.id })
    }
}

impl DropboxEntry {
    /// `None` for deleted (or unknown) entries.
    pub fn normalize(self) -> Result<Option<Entry>> {
        Ok(match self {
            Self::File(file) => Some(Entry::File(file.try_into()?)),
            Self::Folder(folder) => Some(Entry::Folder(folder.try_into()?)),
            Self::Other => None,
        })
    }
}

/// Map a failed Dropbox response onto the error taxonomy.
pub fn classify(status: u16, body: &str, path: &str) -> ErrorKind {
    let summary = serde_json::from_str::<ApiErrorBody>(body)
        .map(|body| body.error_summary)
        .unwrap_or_else(|_| body.trim().to_string());
    if status == 401 || summary.contains("invalid_access_token") || summary.contains("expired_access_token") {
        return ErrorKind::Unauthorized(summary);
    }
    match status {
        409 if summary.contains("not_found") => ErrorKind::NotFound(path.to_string()),
        409 => ErrorKind::Conflict(summary),
        400 => ErrorKind::BadRequest(summary),
        status => ErrorKind::Server { status, message: summary },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FILE: &str = r#"{
        ".tag": "file",
        "name": "a.chopro",
        "id": "id:a4ayc_80_OEAAAAAAAAAXw",
        "client_modified": "2015-05-12T15:50:38Z",
        "server_modified": "2015-05-12T15:50:38Z",
        "rev": "a1c10ce0dd78",
        "size": 7212,
        "path_lower": "/songs/a.chopro",
        "path_display": "/Songs/a.chopro",
        "is_downloadable": true,
        "content_hash": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    }"#;

    #[test]
    fn test_normalize_file() {
        let entry: DropboxEntry = serde_json::from_str(FILE).unwrap();
        let Some(Entry::File(file)) = entry.normalize().unwrap() else { panic!("expected a file") };
        assert_eq!(file.path, "/Songs/a.chopro");
        assert_eq!(file.rev, "a1c10ce0dd78");
        assert!(file.is_downloadable);
        assert_eq!(file.hash.len(), 64);
    }

    #[test]
    fn test_untagged_file_and_defaults() {
        let file: DropboxFile = serde_json::from_str(
            r#"{"name":"b","id":"id:b","path_lower":"/b","client_modified":"2015-05-12T15:50:38Z",
                "server_modified":"2015-05-12T15:50:38Z","rev":"1","size":0}"#,
        )
        .unwrap();
        let file = FileMetadata::try_from(file).unwrap();
        assert_eq!(file.path, "/b");
        assert_eq!(file.hash, "");
        assert!(!file.is_downloadable);
    }

    #[test]
    fn test_deleted_entries_are_dropped() {
        let entry: DropboxEntry = serde_json::from_str(r#"{".tag":"deleted","name":"gone","path_lower":"/gone"}"#).unwrap();
        assert!(entry.normalize().unwrap().is_none());
    }

    #[test]
    fn test_write_mode_json() {
        assert_eq!(serde_json::to_string(&WriteMode::Add).unwrap(), r#"{".tag":"add"}"#);
        assert_eq!(
            serde_json::to_string(&WriteMode::Update { update: "a1c".into() }).unwrap(),
            r#"{".tag":"update","update":"a1c"}"#
        );
    }

    #[rstest]
    #[case(409, r#"{"error_summary":"path/not_found/..","error":{".tag":"path"}}"#, "not_found")]
    #[case(409, r#"{"error_summary":"from_lookup/not_found/.."}"#, "not_found")]
    #[case(409, r#"{"error_summary":"to/conflict/file/.."}"#, "conflict")]
    #[case(401, r#"{"error_summary":"expired_access_token/.."}"#, "unauthorized")]
    #[case(400, "Error in call to API function", "bad_request")]
    #[case(503, "", "server")]
    fn test_classify(#[case] status: u16, #[case] body: &str, #[case] expected: &str) {
        let kind = classify(status, body, "/Songs/a.chopro");
        let actual = match kind {
            ErrorKind::NotFound(path) => {
                assert_eq!(path, "/Songs/a.chopro");
                "not_found"
            },
            ErrorKind::Conflict(_) => "conflict",
            ErrorKind::Unauthorized(_) => "unauthorized",
            ErrorKind::BadRequest(_) => "bad_request",
            ErrorKind::Server { .. } => "server",
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(actual, expected);
    }
}
