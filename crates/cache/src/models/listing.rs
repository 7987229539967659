use super::from_millis;
use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use songbook_storage::{Entry, FolderListing};

/// A row of the `folder_listings` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ListingRow {
    pub path: String,
    pub stored_at: i64,
    pub entries: String,
}

impl ListingRow {
    pub fn entries(&self) -> Result<Vec<Entry>, Error> {
        serde_json::from_str(&self.entries).or_raise(|| ErrorKind::InvalidData("folder listing entries"))
    }

    pub fn encode(entries: &[Entry]) -> Result<String, Error> {
        serde_json::to_string(entries).or_raise(|| ErrorKind::InvalidData("folder listing entries"))
    }
}

impl TryFrom<ListingRow> for FolderListing {
    type Error = Error;
    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            stored_at: from_millis(row.stored_at).ok_or_raise(|| ErrorKind::InvalidData("stored at time"))?,
            files: row.entries()?,
            path: row.path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use songbook_storage::{FileMetadata, FolderMetadata};

    #[test]
    fn test_entries_are_tagged_json() {
        let entries = vec![
            Entry::Folder(FolderMetadata { name: "B".into(), path: "/A/B".into(), id: "f".into() }),
            Entry::File(FileMetadata::local("/A/c.txt", b"c").unwrap()),
        ];
        let encoded = ListingRow::encode(&entries).unwrap();
        assert!(encoded.starts_with(r#"[{"type":"folder""#));
        let row = ListingRow { path: "/A".into(), stored_at: 0, entries: encoded };
        let listing = FolderListing::try_from(row).unwrap();
        assert_eq!(listing.files, entries);
        assert_eq!(listing.stored_at.unix_timestamp(), 0);
    }

    #[test]
    fn test_corrupt_entries() {
        let row = ListingRow { path: "/A".into(), stored_at: 0, entries: "{".into() };
        let err = row.entries().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }
}
