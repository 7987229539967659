//! The offline cache as a [`FileStore`].

use crate::error::into_storage;
use crate::repo::{HashMatchPolicy, Repository, WriteRule};
use crate::{Database, StoredFile};
use async_trait::async_trait;
use songbook_storage::archive::ArchiveBuilder;
use songbook_storage::error::{ErrorKind, Result};
use songbook_storage::path::{self, canonicalize};
use songbook_storage::{
    BlobFile, Entry, FileMetadata, FileStore, FileStoreCache, FolderListing, FolderMetadata, SaveMode, SaveTarget,
};
use std::collections::HashSet;

/// SQLite-backed file store used for offline reads and write-through.
///
/// Paths are canonicalized on the way in; the [`Repository`] underneath
/// only ever sees canonical paths. Failures come back in the storage error
/// taxonomy, with a cache miss reported as
/// [`NotFound`](songbook_storage::error::ErrorKind::NotFound).
///
/// # Examples
///
/// ```
/// use songbook_cache::{Database, OfflineCache};
/// use songbook_storage::{FileStore, SaveMode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::connect_in_memory().await.unwrap();
/// let cache = OfflineCache::new(&db);
/// cache.create_folder("/Songs").await.unwrap();
/// cache.save_text("/Songs/a.chopro".into(), SaveMode::Add, "{t:A}").await.unwrap();
/// assert_eq!(cache.list_files("/Songs").await.unwrap().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OfflineCache {
    name: String,
    repo: Repository,
    policy: HashMatchPolicy,
}

impl OfflineCache {
    pub fn new(db: &Database) -> Self {
        Self { name: "offline cache".to_string(), repo: Repository::from(db), policy: HashMatchPolicy::default() }
    }

    pub fn with_policy(mut self, policy: HashMatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> HashMatchPolicy {
        self.policy
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// The stored file with its `stored_at` timestamp.
    pub async fn stored_file(&self, path: &str) -> Result<StoredFile> {
        let path = canonicalize(path)?;
        self.repo.load_file(&path).await.map_err(into_storage)
    }

    /// The stored listing with its `stored_at` timestamp.
    pub async fn folder_listing(&self, path: &str) -> Result<FolderListing> {
        let path = canonicalize(path)?;
        self.repo.list(&path).await.map_err(into_storage)
    }

    /// Returns `true` if a file or a folder listing is stored at `path`.
    pub async fn is_cached(&self, path: &str) -> Result<bool> {
        let path = canonicalize(path)?;
        self.repo.is_cached(&path).await.map_err(into_storage)
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let path = canonicalize(path)?;
        self.repo.file_exists(&path).await.map_err(into_storage)
    }

    pub async fn file_count(&self) -> Result<u64> {
        self.repo.file_count().await.map_err(into_storage)
    }

    /// Bytes used by stored files. Approximate; meant for quota displays.
    pub async fn approximate_size(&self) -> Result<u64> {
        self.repo.approximate_size().await.map_err(into_storage)
    }

    /// Forget everything.
    pub async fn clear(&self) -> Result<()> {
        tracing::info!("Clearing the offline cache");
        self.repo.clear().await.map_err(into_storage)
    }

    /// Paths of the given entries whose contents are available offline.
    pub async fn cached_paths(&self, entries: &[Entry]) -> Result<HashSet<String>> {
        self.repo.cached_paths(entries.iter().map(Entry::path)).await.map_err(into_storage)
    }

    /// Replace what is stored at `old_path` with `entry`.
    pub async fn update_metadata(&self, old_path: &str, mut entry: Entry) -> Result<Entry> {
        let old_path = canonicalize(old_path)?;
        let new_path = canonicalize(entry.path())?;
        entry.relocate(new_path);
        self.repo.update_metadata(&old_path, entry).await.map_err(into_storage)
    }
}

#[async_trait]
impl FileStore for OfflineCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let path = canonicalize(target.path())?;
        if path::is_root(&path) {
            exn::bail!(ErrorKind::BadRequest("cannot save a file at the root".to_string()));
        }
        let (metadata, rule) = match (target, mode) {
            // A new version of a file loaded earlier: fresh rev, same identity.
            (SaveTarget::Metadata(previous), SaveMode::Update) => {
                let mut metadata = FileMetadata::local(&path, &contents)?;
                metadata.id = previous.id;
                (metadata, WriteRule::IfRev(previous.rev))
            },
            // Metadata reported by a remote is stored as-is.
            (SaveTarget::Metadata(mut metadata), _) => {
                metadata.relocate(path);
                (metadata, WriteRule::Replace)
            },
            (SaveTarget::Path(_), SaveMode::Add) => (FileMetadata::local(&path, &contents)?, WriteRule::Autorename),
            (SaveTarget::Path(_), _) => (FileMetadata::local(&path, &contents)?, WriteRule::Replace),
        };
        self.repo.save_file(metadata, &contents, rule, self.policy).await.map_err(into_storage)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        let StoredFile { metadata, contents, .. } = self.stored_file(path).await?;
        Ok(BlobFile { metadata, blob: contents })
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        Ok(self.folder_listing(path).await?.files)
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<Entry> {
        let from = canonicalize(from)?;
        let to = canonicalize(to)?;
        self.repo.move_entry(&from, &to).await.map_err(into_storage)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let path = canonicalize(path)?;
        self.repo.create_folder(&path).await.map_err(into_storage)
    }

    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        let path = canonicalize(path)?;
        let mut archive = ArchiveBuilder::new();
        for (entry, contents) in self.repo.walk(&path).await.map_err(into_storage)? {
            let Some(name) = path::relative_to(entry.path(), &path) else { continue };
            match (&entry, contents) {
                (Entry::Folder(_), _) => archive.add_folder(name)?,
                (Entry::File(_), Some(contents)) => archive.add_file(name, &contents)?,
                // Listed, but never downloaded.
                (Entry::File(_), None) => {},
            }
        }
        archive.finish()
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = canonicalize(path)?;
        self.repo.delete(&path).await.map_err(into_storage)
    }
}

#[async_trait]
impl FileStoreCache for OfflineCache {
    async fn add_folder_listing(&self, path: &str, entries: Vec<Entry>) -> Result<FolderListing> {
        let path = canonicalize(path)?;
        self.repo.put_listing(&path, entries).await.map_err(into_storage)
    }
}
