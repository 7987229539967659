//! In-memory file store for testing.

use crate::archive::ArchiveBuilder;
use crate::error::{ErrorKind, Result};
use crate::models::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, sort_entries};
use crate::path::{self, canonicalize};
use crate::store::{CacheHandle, FileStore};
use crate::mirror::WriteThrough;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Node {
    File(FileMetadata, Vec<u8>),
    Folder(FolderMetadata),
}

/// In-memory file store for testing.
///
/// Entries live in a `BTreeMap` behind a [`RwLock`], so all trait methods can
/// operate on `&self` without external synchronisation. Ideal for tests that
/// need a [`FileStore`] (optionally with a cache attached) without a
/// filesystem or network.
///
/// # Examples
///
/// ```
/// use songbook_storage::backend::MockStore;
/// use songbook_storage::FileStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockStore::with_files([
///     ("/Songs/a.chopro", "{t:A}"),
/// ]);
/// assert_eq!(store.load_text("/Songs/a.chopro").await.unwrap().text, "{t:A}");
/// assert_eq!(store.list_files("/").await.unwrap().len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockStore {
    name: String,
    storage: RwLock<BTreeMap<String, Node>>,
    writes: WriteThrough,
    failure: std::sync::Mutex<Option<ErrorKind>>,
    calls: AtomicUsize,
}

impl MockStore {
    /// Create a mock store pre-populated with files (and their folders).
    ///
    /// Panics if any path is invalid. If test setup is wrong, then the test
    /// should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl AsRef<str>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        for (path, data) in files {
            let data = data.into();
            let Ok(metadata) = FileMetadata::local(path.as_ref(), &data) else {
                // The panic here is DELIBERATE. There is no error result.
                panic!("MockStore::with_files: invalid path {}", path.as_ref());
            };
            Self::insert_parents(&mut map, &metadata.path);
            map.insert(metadata.path.clone(), Node::File(metadata, data));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            writes: WriteThrough::default(),
            failure: std::sync::Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheHandle) -> Self {
        self.writes = WriteThrough::new(Some(cache));
        self
    }

    pub fn write_through(&self) -> &WriteThrough {
        &self.writes
    }

    /// Make every following operation fail with `kind` (`None` to recover).
    pub fn fail_with(&self, kind: Option<ErrorKind>) {
        *self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = kind;
    }

    /// Number of trait operations performed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            Some(kind) => Err(exn::Exn::from(kind)),
            None => Ok(()),
        }
    }

    fn insert_parents(map: &mut BTreeMap<String, Node>, path: &str) {
        let mut parent = path::dirname(path).to_string();
        while !path::is_root(&parent) {
            map.entry(parent.clone()).or_insert_with(|| {
                Node::Folder(FolderMetadata {
                    name: path::basename(&parent).to_string(),
                    path: parent.clone(),
                    id: format!("mock:{parent}"),
                })
            });
            parent = path::dirname(&parent).to_string();
        }
    }

    fn ensure_parent_folders(map: &mut BTreeMap<String, Node>, path: &str) -> Result<()> {
        let mut parent = path::dirname(path);
        while !path::is_root(parent) {
            if let Some(Node::File(..)) = map.get(parent) {
                exn::bail!(ErrorKind::Conflict(format!("`{parent}` is a file")));
            }
            parent = path::dirname(parent);
        }
        Self::insert_parents(map, path);
        Ok(())
    }
}
impl Default for MockStore {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl FileStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        self.begin()?;
        let mut metadata = FileMetadata::local(target.path(), &contents)?;
        let mut guard = self.storage.write().await;
        match guard.get(&metadata.path) {
            Some(Node::Folder(_)) => exn::bail!(ErrorKind::Conflict(format!("`{}` is a folder", metadata.path))),
            Some(Node::File(existing, _)) if mode == SaveMode::Add => {
                if existing.same_contents(&metadata) {
                    return Ok(existing.clone());
                }
                let requested = metadata.path.clone();
                let mut n = 1;
                while guard.contains_key(&path::autorename(&requested, n)) {
                    n += 1;
                }
                metadata.relocate(path::autorename(&requested, n));
            },
            Some(Node::File(existing, _)) => {
                if let (SaveMode::Update, Some(expected)) = (mode, target.metadata())
                    && expected.rev != existing.rev
                {
                    exn::bail!(ErrorKind::Conflict(format!("`{}` has changed since it was loaded", metadata.path)));
                }
                metadata.id = existing.id.clone();
            },
            None => {},
        }
        Self::ensure_parent_folders(&mut guard, &metadata.path)?;
        guard.insert(metadata.path.clone(), Node::File(metadata.clone(), contents.clone()));
        drop(guard);

        let mirrored = metadata.clone();
        self.writes.mirror("save_blob", &metadata.path, move |cache| async move {
            cache.save_blob(mirrored.into(), SaveMode::Overwrite, contents).await
        });
        Ok(metadata)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        self.begin()?;
        let path = canonicalize(path)?;
        let file = match self.storage.read().await.get(&path) {
            Some(Node::File(metadata, blob)) => BlobFile { metadata: metadata.clone(), blob: blob.clone() },
            Some(Node::Folder(_)) => exn::bail!(ErrorKind::Conflict(format!("`{path}` is a folder"))),
            None => exn::bail!(ErrorKind::NotFound(path)),
        };

        let mirrored = file.clone();
        self.writes.mirror("load_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.metadata.into(), SaveMode::Overwrite, mirrored.blob).await
        });
        Ok(file)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        self.begin()?;
        let path = canonicalize(path)?;
        let guard = self.storage.read().await;
        match guard.get(&path) {
            Some(Node::File(..)) => exn::bail!(ErrorKind::Conflict(format!("`{path}` is not a folder"))),
            None if !path::is_root(&path) => exn::bail!(ErrorKind::NotFound(path)),
            _ => {},
        }
        let mut entries: Vec<Entry> = guard
            .iter()
            .filter(|(key, _)| path::dirname(key) == path && !path::is_root(key))
            .map(|(_, node)| match node {
                Node::File(metadata, _) => Entry::File(metadata.clone()),
                Node::Folder(metadata) => Entry::Folder(metadata.clone()),
            })
            .collect();
        drop(guard);
        sort_entries(&mut entries);

        let mirrored = entries.clone();
        let folder = path.clone();
        self.writes.mirror("list_files", &path, move |cache| async move {
            cache.add_folder_listing(&folder, mirrored).await
        });
        Ok(entries)
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<Entry> {
        self.begin()?;
        let from = canonicalize(from)?;
        let to = canonicalize(to)?;
        if path::is_root(&from) || path::is_within(&to, &from) {
            exn::bail!(ErrorKind::BadRequest(format!("cannot move `{from}` to `{to}`")));
        }
        let mut guard = self.storage.write().await;
        if !guard.contains_key(&from) {
            exn::bail!(ErrorKind::NotFound(from));
        }
        if guard.contains_key(&to) {
            exn::bail!(ErrorKind::Conflict(format!("`{to}` already exists")));
        }
        Self::ensure_parent_folders(&mut guard, &to)?;
        let moved: Vec<String> = guard.keys().filter(|key| path::is_within(key, &from)).cloned().collect();
        for old in moved {
            let Some(mut node) = guard.remove(&old) else { continue };
            let Some(new) = path::rebase(&old, &from, &to) else { continue };
            match &mut node {
                Node::File(metadata, _) => metadata.relocate(new.clone()),
                Node::Folder(metadata) => metadata.relocate(new.clone()),
            }
            guard.insert(new, node);
        }
        let entry = match guard.get(&to) {
            Some(Node::File(metadata, _)) => Entry::File(metadata.clone()),
            Some(Node::Folder(metadata)) => Entry::Folder(metadata.clone()),
            None => exn::bail!(ErrorKind::NotFound(to)),
        };
        drop(guard);

        let (source, destination) = (from.clone(), to);
        self.writes.mirror("move_entry", &from, move |cache| async move {
            cache.move_entry(&source, &destination).await
        });
        Ok(entry)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        self.begin()?;
        let folder = FolderMetadata::local(path)?;
        let mut guard = self.storage.write().await;
        let folder = match guard.get(&folder.path) {
            Some(Node::File(..)) => exn::bail!(ErrorKind::Conflict(format!("`{}` is a file", folder.path))),
            Some(Node::Folder(existing)) => existing.clone(),
            None => {
                Self::ensure_parent_folders(&mut guard, &folder.path)?;
                guard.insert(folder.path.clone(), Node::Folder(folder.clone()));
                folder
            },
        };
        drop(guard);

        let created = folder.path.clone();
        self.writes.mirror("create_folder", &folder.path, move |cache| async move {
            cache.create_folder(&created).await
        });
        Ok(folder)
    }

    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        self.begin()?;
        let path = canonicalize(path)?;
        let guard = self.storage.read().await;
        if !path::is_root(&path) && !matches!(guard.get(&path), Some(Node::Folder(_))) {
            exn::bail!(ErrorKind::NotFound(path));
        }
        let mut archive = ArchiveBuilder::new();
        for (key, node) in guard.iter() {
            let Some(relative) = path::relative_to(key, &path) else { continue };
            match node {
                Node::File(_, blob) => archive.add_file(relative, blob)?,
                Node::Folder(_) => archive.add_folder(relative)?,
            }
        }
        archive.finish()
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.begin()?;
        let path = canonicalize(path)?;
        if path::is_root(&path) {
            exn::bail!(ErrorKind::BadRequest("cannot delete the root".to_string()));
        }
        let mut guard = self.storage.write().await;
        if !guard.contains_key(&path) {
            exn::bail!(ErrorKind::NotFound(path));
        }
        guard.retain(|key, _| !path::is_within(key, &path));
        drop(guard);

        let deleted = path.clone();
        self.writes.mirror("delete", &path, move |cache| async move { cache.delete(&deleted).await });
        Ok(())
    }

    fn cache(&self) -> Option<&CacheHandle> {
        self.writes.cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_files_creates_folders() {
        let store = MockStore::with_files([("/A/B/c.txt", "c")]);
        let root = store.list_files("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_folder());
        let nested = store.list_files("/A/B").await.unwrap();
        assert_eq!(nested[0].path(), "/A/B/c.txt");
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let store = MockStore::with_files([("/A/x.txt", "x")]);
        store.move_entry("/A", "/B").await.unwrap();
        assert_eq!(store.load_text("/B/x.txt").await.unwrap().text, "x");
        assert!(store.load_blob("/A/x.txt").await.unwrap_err().is_not_found());
        store.delete("/B").await.unwrap();
        assert!(store.list_files("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_with() {
        let store = MockStore::default();
        store.fail_with(Some(ErrorKind::Network("offline".into())));
        let err = store.list_files("/").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Network(_)));
        store.fail_with(None);
        assert!(store.list_files("/").await.is_ok());
        assert_eq!(store.calls(), 2);
    }
}
