//! Local filesystem file store.
//!
//! This module provides a file store over a directory on the local
//! filesystem, accessed via `tokio::fs`. It is what the file-store server
//! mounts, and it works as a standalone backend for the CLI.

use crate::archive::ArchiveBuilder;
use crate::error::{ErrorKind, Result};
use crate::models::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, content_hash, sort_entries};
use crate::path::{self, canonicalize};
use crate::store::{CacheHandle, FileStore};
use crate::mirror::WriteThrough;
use async_trait::async_trait;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;

/// Never listed or archived.
const IGNORED_NAMES: [&str; 1] = [".DS_Store"];

/// Local filesystem file store.
///
/// All store paths are resolved against the configured root directory; a
/// path that would escape it is rejected before touching the filesystem.
///
/// Metadata is synthesized from `stat`: `id` is `id:<path>`, `rev` is
/// `rev:<mtime in ms>`, and `hash` is the SHA-256 of the contents (computed
/// on every list, load and save so that it is always comparable).
///
/// # Examples
///
/// ```no_run
/// use songbook_storage::backend::LocalStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalStore::new("local", "/absolute/path/to/songs")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalStore {
    name: String,
    /// Root directory of the store
    root: PathBuf,
    writes: WriteThrough,
}

impl LocalStore {
    /// Create a new local filesystem store.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        Ok(Self { name: name.into(), root, writes: WriteThrough::default() })
    }

    /// Attach an offline cache that every successful operation is mirrored into.
    pub fn with_cache(mut self, cache: CacheHandle) -> Self {
        self.writes = WriteThrough::new(Some(cache));
        self
    }

    pub fn write_through(&self) -> &WriteThrough {
        &self.writes
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonicalize a store path and resolve it against the root.
    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let canonical = canonicalize(path)?;
        let absolute = match path::relative_to(&canonical, path::ROOT) {
            Some(relative) => self.root.join(relative),
            None => self.root.clone(),
        };
        Ok((canonical, absolute))
    }

    fn map_io_error(e: std::io::Error, path: &str) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::NotFound => ErrorKind::NotFound(path.to_string()),
            Io::AlreadyExists => ErrorKind::Conflict(format!("`{path}` already exists")),
            Io::NotADirectory => ErrorKind::Conflict(format!("`{path}` is inside something that is not a folder")),
            Io::IsADirectory => ErrorKind::Conflict(format!("`{path}` is a folder")),
            Io::DirectoryNotEmpty => ErrorKind::Conflict(format!("`{path}` is not empty")),
            _ => ErrorKind::Io(format!("{path}: {e}")),
        }
    }

    /// Re-use the same metadata synthesis for list, load and save.
    fn file_metadata(path: &str, metadata: &Metadata, contents: &[u8]) -> Result<FileMetadata> {
        let modified: OffsetDateTime =
            metadata.modified().map_err(|e| Self::map_io_error(e, path))?.into();
        Ok(FileMetadata {
            name: path::basename(path).to_string(),
            path: path.to_string(),
            id: format!("id:{path}"),
            client_modified: modified,
            server_modified: modified,
            rev: format!("rev:{}", modified.unix_timestamp_nanos() / 1_000_000),
            size: metadata.len(),
            is_downloadable: true,
            hash: content_hash(contents),
        })
    }

    fn folder_metadata(path: &str) -> FolderMetadata {
        FolderMetadata {
            name: path::basename(path).to_string(),
            path: path.to_string(),
            id: format!("id:{path}"),
        }
    }

    async fn read_file(&self, path: &str, absolute: &Path) -> Result<BlobFile> {
        let blob = fs::read(absolute).await.map_err(|e| Self::map_io_error(e, path))?;
        let stat = fs::metadata(absolute).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(BlobFile { metadata: Self::file_metadata(path, &stat, &blob)?, blob })
    }

    /// Stat a path, treating "not there" as `None`.
    async fn stat(path: &str, absolute: &Path) -> Result<Option<Metadata>> {
        match fs::metadata(absolute).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(exn::Exn::from(Self::map_io_error(e, path))),
        }
    }

    /// Pick the path an `add` save actually writes to.
    ///
    /// Identical contents at the requested path mean there is nothing to add,
    /// which is reported as `Ok(None)`.
    async fn resolve_add(&self, path: &str, contents: &[u8]) -> Result<Option<String>> {
        let (_, absolute) = self.resolve(path)?;
        if Self::stat(path, &absolute).await?.is_none() {
            return Ok(Some(path.to_string()));
        }
        if fs::read(&absolute).await.is_ok_and(|existing| existing == contents) {
            return Ok(None);
        }
        let mut n = 1;
        loop {
            let candidate = path::autorename(path, n);
            let (_, absolute) = self.resolve(&candidate)?;
            if Self::stat(&candidate, &absolute).await?.is_none() {
                return Ok(Some(candidate));
            }
            n += 1;
        }
    }
}

#[async_trait]
impl FileStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let (requested, absolute) = self.resolve(target.path())?;
        if path::is_root(&requested) {
            exn::bail!(ErrorKind::BadRequest("cannot save to the mount root".to_string()));
        }
        if let Some(stat) = Self::stat(&requested, &absolute).await?
            && stat.is_dir()
        {
            exn::bail!(ErrorKind::Conflict(format!("`{requested}` is a folder")));
        }
        let path = match mode {
            SaveMode::Overwrite => requested,
            SaveMode::Add => match self.resolve_add(&requested, &contents).await? {
                Some(path) => path,
                None => return Ok(self.read_file(&requested, &absolute).await?.metadata),
            },
            SaveMode::Update => {
                if let Some(expected) = target.metadata() {
                    match self.read_file(&requested, &absolute).await {
                        Ok(current) if current.metadata.rev != expected.rev => {
                            exn::bail!(ErrorKind::Conflict(format!("`{requested}` has changed since it was loaded")))
                        },
                        Err(err) if !err.is_not_found() => return Err(err),
                        _ => {},
                    }
                }
                requested
            },
        };
        let (_, absolute) = self.resolve(&path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path::dirname(&path)))?;
        }
        fs::write(&absolute, &contents).await.map_err(|e| Self::map_io_error(e, &path))?;
        let stat = fs::metadata(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        let metadata = Self::file_metadata(&path, &stat, &contents)?;
        tracing::debug!(path = %metadata.path, size = metadata.size, "Saved file");

        let mirrored = metadata.clone();
        self.writes.mirror("save_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.into(), SaveMode::Overwrite, contents).await
        });
        Ok(metadata)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        let (path, absolute) = self.resolve(path)?;
        let file = self.read_file(&path, &absolute).await?;

        let mirrored = file.clone();
        self.writes.mirror("load_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.metadata.into(), SaveMode::Overwrite, mirrored.blob).await
        });
        Ok(file)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        let (path, absolute) = self.resolve(path)?;
        match Self::stat(&path, &absolute).await? {
            None => exn::bail!(ErrorKind::NotFound(path)),
            Some(stat) if !stat.is_dir() => exn::bail!(ErrorKind::Conflict(format!("`{path}` is not a folder"))),
            Some(_) => {},
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        while let Some(dir_entry) = dir.next_entry().await.map_err(|e| Self::map_io_error(e, &path))? {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if IGNORED_NAMES.contains(&name.as_str()) {
                continue;
            }
            let child = path::join(&path, &name);
            // Follow symlinks; anything that can't be stat'ed (most likely a
            // broken symlink) is silently dropped from the listing.
            let Ok(stat) = fs::metadata(dir_entry.path()).await else {
                tracing::debug!(path = %child, "Skipping unreadable entry");
                continue;
            };
            if stat.is_dir() {
                entries.push(Entry::Folder(Self::folder_metadata(&child)));
            } else if stat.is_file() {
                let Ok(contents) = fs::read(dir_entry.path()).await else {
                    tracing::debug!(path = %child, "Skipping unreadable entry");
                    continue;
                };
                entries.push(Entry::File(Self::file_metadata(&child, &stat, &contents)?));
            }
        }
        sort_entries(&mut entries);

        let mirrored = entries.clone();
        let folder = path.clone();
        self.writes.mirror("list_files", &path, move |cache| async move {
            cache.add_folder_listing(&folder, mirrored).await
        });
        Ok(entries)
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<Entry> {
        let (from, from_absolute) = self.resolve(from)?;
        let (to, to_absolute) = self.resolve(to)?;
        if path::is_root(&from) || path::is_root(&to) {
            exn::bail!(ErrorKind::BadRequest("cannot move the mount root".to_string()));
        }
        if from == to {
            exn::bail!(ErrorKind::BadRequest(format!("`{from}` is already at that path")));
        }
        if path::is_within(&to, &from) {
            exn::bail!(ErrorKind::BadRequest(format!("cannot move `{from}` into itself")));
        }
        let Some(stat) = Self::stat(&from, &from_absolute).await? else {
            exn::bail!(ErrorKind::NotFound(from));
        };
        if Self::stat(&to, &to_absolute).await?.is_some() {
            exn::bail!(ErrorKind::Conflict(format!("`{to}` already exists")));
        }
        if let Some(parent) = to_absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path::dirname(&to)))?;
        }
        fs::rename(&from_absolute, &to_absolute).await.map_err(|e| Self::map_io_error(e, &from))?;
        let entry = if stat.is_dir() {
            Entry::Folder(Self::folder_metadata(&to))
        } else {
            Entry::File(self.read_file(&to, &to_absolute).await?.metadata)
        };
        tracing::debug!(from = %from, to = %to, "Moved entry");

        let (source, destination) = (from.clone(), to);
        self.writes.mirror("move_entry", &from, move |cache| async move {
            cache.move_entry(&source, &destination).await
        });
        Ok(entry)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let (path, absolute) = self.resolve(path)?;
        if let Some(stat) = Self::stat(&path, &absolute).await?
            && !stat.is_dir()
        {
            exn::bail!(ErrorKind::Conflict(format!("`{path}` is a file")));
        }
        fs::create_dir_all(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        let folder = Self::folder_metadata(&path);

        let created = path.clone();
        self.writes.mirror("create_folder", &path, move |cache| async move { cache.create_folder(&created).await });
        Ok(folder)
    }

    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        let (path, absolute) = self.resolve(path)?;
        match Self::stat(&path, &absolute).await? {
            None => exn::bail!(ErrorKind::NotFound(path)),
            Some(stat) if !stat.is_dir() => exn::bail!(ErrorKind::Conflict(format!("`{path}` is not a folder"))),
            Some(_) => {},
        }
        let mut archive = ArchiveBuilder::new();
        let mut stack = vec![(absolute, String::new())];
        while let Some((dir, prefix)) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| Self::map_io_error(e, &path))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &path))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if IGNORED_NAMES.contains(&name.as_str()) {
                    continue;
                }
                let relative = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
                let Ok(stat) = fs::metadata(entry.path()).await else {
                    continue;
                };
                if stat.is_dir() {
                    archive.add_folder(&relative)?;
                    stack.push((entry.path(), relative));
                } else if stat.is_file() {
                    let contents = fs::read(entry.path()).await.map_err(|e| Self::map_io_error(e, &relative))?;
                    archive.add_file(&relative, &contents)?;
                }
            }
        }
        archive.finish()
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (path, absolute) = self.resolve(path)?;
        if path::is_root(&path) {
            exn::bail!(ErrorKind::BadRequest("cannot delete the mount root".to_string()));
        }
        let stat = fs::symlink_metadata(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        if stat.is_dir() {
            fs::remove_dir_all(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        } else {
            fs::remove_file(&absolute).await.map_err(|e| Self::map_io_error(e, &path))?;
        }
        tracing::debug!(path = %path, "Deleted entry");

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
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new("local", dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        assert!(LocalStore::new("local", "relative/path").is_err());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, store) = store();
        let saved = store.save_text("/Songs/a.chopro".into(), SaveMode::Overwrite, "{t:A}").await.unwrap();
        assert_eq!(saved.path, "/Songs/a.chopro");
        assert_eq!(saved.id, "id:/Songs/a.chopro");
        assert!(saved.rev.starts_with("rev:"));
        assert_eq!(saved.hash, content_hash(b"{t:A}"));

        let loaded = store.load_text("Songs/./a.chopro").await.unwrap();
        assert_eq!(loaded.text, "{t:A}");
        assert_eq!(loaded.metadata.hash, saved.hash);
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_skips_ds_store() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("Songs/zed")).unwrap();
        std::fs::create_dir_all(dir.path().join("Songs/Alpha")).unwrap();
        std::fs::write(dir.path().join("Songs/b.chopro"), "b").unwrap();
        std::fs::write(dir.path().join("Songs/A.chopro"), "a").unwrap();
        std::fs::write(dir.path().join("Songs/.DS_Store"), "junk").unwrap();

        let entries = store.list_files("/Songs").await.unwrap();
        let names: Vec<_> = entries.iter().map(Entry::name).collect();
        assert_eq!(names, ["Alpha", "zed", "A.chopro", "b.chopro"]);
        assert!(entries[0].is_folder());
    }

    #[tokio::test]
    async fn test_list_errors() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        let err = store.list_files("/file.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        let err = store.list_files("/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let (_dir, store) = store();
        let err = store.load_blob("/../../etc/passwd").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
        let err = store.save_text("/".into(), SaveMode::Overwrite, "x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_add_autorenames_on_conflict() {
        let (_dir, store) = store();
        store.save_text("/a.chopro".into(), SaveMode::Add, "one").await.unwrap();
        let same = store.save_text("/a.chopro".into(), SaveMode::Add, "one").await.unwrap();
        assert_eq!(same.path, "/a.chopro");
        let renamed = store.save_text("/a.chopro".into(), SaveMode::Add, "two").await.unwrap();
        assert_eq!(renamed.path, "/a (1).chopro");
        let renamed = store.save_text("/a.chopro".into(), SaveMode::Add, "three").await.unwrap();
        assert_eq!(renamed.path, "/a (2).chopro");
    }

    #[tokio::test]
    async fn test_update_checks_rev() {
        let (_dir, store) = store();
        let saved = store.save_text("/a.chopro".into(), SaveMode::Overwrite, "one").await.unwrap();
        let mut stale = saved.clone();
        stale.rev = "rev:0".to_string();
        let err = store.save_text(stale.into(), SaveMode::Update, "two").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        store.save_text(saved.into(), SaveMode::Update, "two").await.unwrap();
        assert_eq!(store.load_text("/a.chopro").await.unwrap().text, "two");
    }

    #[tokio::test]
    async fn test_move_folder() {
        let (_dir, store) = store();
        store.save_text("/A/x.txt".into(), SaveMode::Overwrite, "x").await.unwrap();
        let moved = store.move_entry("/A", "/B/C").await.unwrap();
        assert!(moved.is_folder());
        assert_eq!(moved.path(), "/B/C");
        assert_eq!(store.load_text("/B/C/x.txt").await.unwrap().text, "x");
        assert!(store.load_blob("/A/x.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_refuses_to_overwrite() {
        let (_dir, store) = store();
        store.save_text("/a.txt".into(), SaveMode::Overwrite, "a").await.unwrap();
        store.save_text("/b.txt".into(), SaveMode::Overwrite, "b").await.unwrap();
        let err = store.move_entry("/a.txt", "/b.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        let err = store.move_entry("/missing.txt", "/c.txt").await.unwrap_err();
        assert!(err.is_not_found());
        store.create_folder("/A").await.unwrap();
        let err = store.move_entry("/A", "/A/inner").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_create_folder_keeps_contents() {
        let (_dir, store) = store();
        store.save_text("/Songs/a.chopro".into(), SaveMode::Overwrite, "a").await.unwrap();
        let folder = store.create_folder("/Songs").await.unwrap();
        assert_eq!(folder.name, "Songs");
        assert_eq!(store.list_files("/Songs").await.unwrap().len(), 1);
        let err = store.create_folder("/Songs/a.chopro").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_recursive() {
        let (_dir, store) = store();
        store.save_text("/A/B/c.txt".into(), SaveMode::Overwrite, "c").await.unwrap();
        store.delete("/A").await.unwrap();
        assert!(store.list_files("/A").await.unwrap_err().is_not_found());
        assert!(store.list_files("/").await.unwrap().is_empty());
        assert!(store.delete("/A").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_compress_folder() {
        let (_dir, store) = store();
        store.save_text("/Set/a.chopro".into(), SaveMode::Overwrite, "{t:A}").await.unwrap();
        store.save_text("/Set/Encore/b.chopro".into(), SaveMode::Overwrite, "{t:B}").await.unwrap();
        let bytes = store.compress_folder("/Set").await.unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut text = String::new();
        archive.by_name("Encore/b.chopro").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "{t:B}");
        assert!(archive.by_name("a.chopro").is_ok());
        let err = store.compress_folder("/Set/a.chopro").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
    }
}
