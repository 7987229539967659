//! The file-store contract.
//!
//! Remote backends and the offline cache implement the same trait, so a
//! backend's cache is just another [`FileStore`] (one that also accepts whole
//! folder listings, see [`FileStoreCache`]).

use crate::error::Result;
use crate::models::{BlobFile, Entry, FileMetadata, FolderListing, FolderMetadata, SaveMode, SaveTarget, TextFile};
use async_trait::async_trait;
use std::sync::Arc;

/// Unified interface for file stores.
///
/// All paths are canonicalized by the implementation; callers may pass
/// anything [`canonicalize`](crate::path::canonicalize) accepts.
///
/// # Examples
///
/// ```
/// use songbook_storage::error::Result;
/// use songbook_storage::{FileStore, SaveMode};
///
/// async fn touch(store: &dyn FileStore, path: &str) -> Result<()> {
///     match store.load_text(path).await {
///         Ok(_) => Ok(()),
///         Err(err) if err.is_not_found() => {
///             store.save_text(path.into(), SaveMode::Add, "").await?;
///             Ok(())
///         },
///         Err(err) => Err(err),
///     }
/// }
/// ```
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Name used in logs and user-facing messages.
    fn name(&self) -> &str;

    /// Write `contents`, returning the metadata the store assigned.
    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata>;

    /// Write UTF-8 text.
    async fn save_text(&self, target: SaveTarget, mode: SaveMode, text: &str) -> Result<FileMetadata> {
        self.save_blob(target, mode, text.as_bytes().to_vec()).await
    }

    /// Fails with [`NotFound`](crate::error::ErrorKind::NotFound) if absent.
    async fn load_blob(&self, path: &str) -> Result<BlobFile>;

    async fn load_text(&self, path: &str) -> Result<TextFile> {
        TextFile::try_from(self.load_blob(path).await?)
    }

    /// Direct children of a folder, in canonical order.
    async fn list_files(&self, path: &str) -> Result<Vec<Entry>>;

    /// Move (or rename) a file or folder. Never overwrites the destination.
    async fn move_entry(&self, from: &str, to: &str) -> Result<Entry>;

    /// Create a folder (and its parents). An existing folder keeps its contents.
    async fn create_folder(&self, path: &str) -> Result<FolderMetadata>;

    /// Zip archive of a folder's contents.
    ///
    /// Backends that cannot do this fail with
    /// [`Unsupported`](crate::error::ErrorKind::Unsupported).
    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a file, or a folder recursively.
    async fn delete(&self, path: &str) -> Result<()>;

    /// The offline cache attached to this store, if any.
    fn cache(&self) -> Option<&CacheHandle> {
        None
    }
}

/// A file store that can also take whole folder listings reported by a remote.
#[async_trait]
pub trait FileStoreCache: FileStore {
    /// Replace the listing stored for `path` with `entries`.
    async fn add_folder_listing(&self, path: &str, entries: Vec<Entry>) -> Result<FolderListing>;
}

pub type StoreHandle = Arc<dyn FileStore + Send + Sync>;
pub type CacheHandle = Arc<dyn FileStoreCache + Send + Sync>;
