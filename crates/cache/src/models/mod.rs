mod file;
mod listing;

pub(crate) use self::file::FileRow;
pub(crate) use self::listing::ListingRow;
pub use self::file::StoredFile;

use time::OffsetDateTime;

/// Row timestamps are Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

pub(crate) fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
