//! SQLite offline cache for songbook file stores.
//!
//! The cache keeps the last known state of a remote store so that reads keep
//! working without a network connection. It is not the source of truth: the
//! remote is. Deleting the database loses nothing but the offline copy.
//!
//! # Architecture
//! The cache stores two entity types:
//! - **Files**: metadata plus contents, keyed by canonical path.
//! - **Folder listings**: the direct children of a folder, as last reported
//!   by the remote (or as built up by local writes).
//!
//! Every stored file and every listed folder (except the root) appears in its
//! parent's listing. Each [`Repository`] method runs in a single transaction,
//! so that invariant holds between any two operations.
//!
//! [`OfflineCache`] wraps the repository as a
//! [`FileStore`](songbook_storage::FileStore), which is what backends mirror
//! their writes into.

mod db;
pub mod error;
mod models;
mod repo;
mod store;

pub use crate::db::Database;
pub use crate::models::StoredFile;
pub use crate::repo::{HashMatchPolicy, Repository, WalkItem, WriteRule};
pub use crate::store::OfflineCache;
