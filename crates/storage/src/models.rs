//! Backend-agnostic metadata model.
//!
//! Every backend normalizes its native responses into these shapes. The JSON
//! representation (camelCase fields, `type` tag on [`Entry`]) is the one used
//! on the wire by the file-store server and inside the offline cache.

use crate::error::{ErrorKind, Result};
use crate::path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use time::OffsetDateTime;

/// A single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    /// Canonical path, unique within a store.
    pub path: String,
    /// Backend-assigned identifier. Opaque.
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub client_modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub server_modified: OffsetDateTime,
    /// Backend-assigned revision token. Opaque.
    pub rev: String,
    pub size: u64,
    pub is_downloadable: bool,
    /// Content hash. Equal hashes mean equal contents; an empty hash means
    /// the backend did not provide one and never matches anything.
    pub hash: String,
}

impl FileMetadata {
    /// Build metadata for contents created locally (not reported by a remote).
    ///
    /// The id and rev are random, both timestamps are "now".
    pub fn local(path: &str, contents: &[u8]) -> Result<Self> {
        let path = path::canonicalize(path)?;
        if path::is_root(&path) {
            exn::bail!(ErrorKind::BadRequest("cannot save a file at the root".to_string()));
        }
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            name: path::basename(&path).to_string(),
            path,
            id: uuid::Uuid::new_v4().to_string(),
            client_modified: now,
            server_modified: now,
            rev: uuid::Uuid::new_v4().to_string(),
            size: contents.len() as u64,
            is_downloadable: true,
            hash: content_hash(contents),
        })
    }

    /// Returns `true` when both hashes are known and equal.
    pub fn same_contents(&self, other: &FileMetadata) -> bool {
        !self.hash.is_empty() && self.hash == other.hash
    }

    /// Move this metadata to a new path, keeping `name` in sync.
    pub fn relocate(&mut self, new_path: String) {
        self.name = path::basename(&new_path).to_string();
        self.path = new_path;
    }
}

/// A folder. Folders have no content identity beyond their listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMetadata {
    pub name: String,
    pub path: String,
    pub id: String,
}

impl FolderMetadata {
    /// A folder entry created locally, with a random id.
    pub fn local(path: &str) -> Result<Self> {
        let path = path::canonicalize(path)?;
        Ok(Self {
            name: path::basename(&path).to_string(),
            path,
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn relocate(&mut self, new_path: String) {
        self.name = path::basename(&new_path).to_string();
        self.path = new_path;
    }
}

/// A direct child of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entry {
    File(FileMetadata),
    Folder(FolderMetadata),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Self::File(file) => &file.path,
            Self::Folder(folder) => &folder.path,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => &file.name,
            Self::Folder(folder) => &folder.name,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::File(file) => &file.id,
            Self::Folder(folder) => &folder.id,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder(_))
    }

    pub fn relocate(&mut self, new_path: String) {
        match self {
            Self::File(file) => file.relocate(new_path),
            Self::Folder(folder) => folder.relocate(new_path),
        }
    }
}
impl From<FileMetadata> for Entry {
    fn from(file: FileMetadata) -> Self {
        Self::File(file)
    }
}
impl From<FolderMetadata> for Entry {
    fn from(folder: FolderMetadata) -> Self {
        Self::Folder(folder)
    }
}

/// Canonical listing order: folders first, then by name.
///
/// Names compare case-insensitively first so `b.txt` sits between `A.txt`
/// and `C.txt`; ties fall back to a plain comparison to keep the order total.
pub fn compare_entries(a: &Entry, b: &Entry) -> Ordering {
    b.is_folder()
        .cmp(&a.is_folder())
        .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
        .then_with(|| a.name().cmp(b.name()))
}

pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(compare_entries);
}

/// A cached folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderListing {
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
    pub path: String,
    /// Direct children only.
    pub files: Vec<Entry>,
}

/// How a save treats an existing file at the target path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    #[default]
    Overwrite,
    /// Never replace; backends autorename on conflict.
    Add,
    /// Replace only the revision described by the given metadata.
    Update,
}

impl SaveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Add => "add",
            Self::Update => "update",
        }
    }
}

/// Where a save goes: a bare path, or existing metadata (for `update` saves
/// and for mirroring a remote result into the cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    Path(String),
    Metadata(FileMetadata),
}

impl SaveTarget {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Metadata(metadata) => &metadata.path,
        }
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        match self {
            Self::Path(_) => None,
            Self::Metadata(metadata) => Some(metadata),
        }
    }
}
impl From<&str> for SaveTarget {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}
impl From<String> for SaveTarget {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}
impl From<FileMetadata> for SaveTarget {
    fn from(metadata: FileMetadata) -> Self {
        Self::Metadata(metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFile {
    pub metadata: FileMetadata,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFile {
    pub metadata: FileMetadata,
    pub text: String,
}

impl TryFrom<BlobFile> for TextFile {
    type Error = crate::error::Error;

    fn try_from(file: BlobFile) -> Result<Self> {
        let BlobFile { metadata, blob } = file;
        match String::from_utf8(blob) {
            Ok(text) => Ok(Self { metadata, text }),
            Err(_) => exn::bail!(ErrorKind::InvalidData(format!("`{}` is not valid UTF-8 text", metadata.path))),
        }
    }
}

/// SHA-256 hex digest of the given bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
