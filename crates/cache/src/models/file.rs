use super::from_millis;
use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use songbook_storage::FileMetadata;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A file as the cache holds it: metadata, when it was stored, and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub metadata: FileMetadata,
    pub stored_at: OffsetDateTime,
    pub contents: Vec<u8>,
}

/// Metadata columns of the `files` table (everything but the contents).
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FileRow {
    pub path: String,
    pub name: String,
    pub id: String,
    pub client_modified: String,
    pub server_modified: String,
    pub rev: String,
    pub size: i64,
    pub is_downloadable: bool,
    pub hash: String,
    pub stored_at: i64,
}

impl FileRow {
    pub fn new(metadata: &FileMetadata, stored_at: i64) -> Result<Self, Error> {
        Ok(Self {
            path: metadata.path.clone(),
            name: metadata.name.clone(),
            id: metadata.id.clone(),
            client_modified: metadata.client_modified.format(&Rfc3339).or_raise(|| ErrorKind::InvalidData("client modified time"))?,
            server_modified: metadata.server_modified.format(&Rfc3339).or_raise(|| ErrorKind::InvalidData("server modified time"))?,
            rev: metadata.rev.clone(),
            size: i64::try_from(metadata.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            is_downloadable: metadata.is_downloadable,
            hash: metadata.hash.clone(),
            stored_at,
        })
    }

    pub fn stored_at(&self) -> Result<OffsetDateTime, Error> {
        from_millis(self.stored_at).ok_or_raise(|| ErrorKind::InvalidData("stored at time"))
    }
}

impl TryFrom<FileRow> for FileMetadata {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            client_modified: OffsetDateTime::parse(&row.client_modified, &Rfc3339)
                .or_raise(|| ErrorKind::InvalidData("client modified time"))?,
            server_modified: OffsetDateTime::parse(&row.server_modified, &Rfc3339)
                .or_raise(|| ErrorKind::InvalidData("server modified time"))?,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            name: row.name,
            path: row.path,
            id: row.id,
            rev: row.rev,
            is_downloadable: row.is_downloadable,
            hash: row.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_round_trip_keeps_metadata() {
        let metadata = FileMetadata::local("/Songs/a.chopro", b"{t:A}").unwrap();
        let row = FileRow::new(&metadata, 1_700_000_000_000).unwrap();
        assert_eq!(row.size, 5);
        assert_eq!(row.stored_at().unwrap().unix_timestamp(), 1_700_000_000);
        let back = FileMetadata::try_from(row).unwrap();
        // RFC 3339 keeps sub-second precision.
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_negative_size_is_invalid() {
        let metadata = FileMetadata::local("/a", b"").unwrap();
        let mut row = FileRow::new(&metadata, 0).unwrap();
        row.size = -1;
        let err = FileMetadata::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("file size")));
    }
}
