//! File-store contract and backends.
//!
//! One [`FileStore`] trait, implemented by every remote backend and by the
//! offline cache. Backends normalize their responses into the shared
//! [metadata model](models), report failures with one [error taxonomy](error),
//! and mirror successful operations into an attached cache through
//! [`WriteThrough`].

pub mod archive;
pub mod backend;
pub mod error;
mod mirror;
pub mod models;
pub mod path;
pub mod protocol;
mod store;

pub use crate::error::log_cache_error;
pub use crate::mirror::WriteThrough;
pub use crate::models::{
    BlobFile, Entry, FileMetadata, FolderListing, FolderMetadata, SaveMode, SaveTarget, TextFile, content_hash,
    sort_entries,
};
pub use crate::store::{CacheHandle, FileStore, FileStoreCache, StoreHandle};
