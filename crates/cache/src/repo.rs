//! Grouped-transaction access to the `files` and `folder_listings` tables.
//!
//! Files and listings are tightly coupled: a stored file must appear in its
//! parent's listing, and every listing must have an ancestor chain of listings
//! up to the root. Every public method therefore runs in exactly one
//! transaction; a failure partway through rolls back everything the operation
//! touched.
//!
//! Callers pass canonical paths (see [`songbook_storage::path`]).

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{FileRow, ListingRow, StoredFile, now_millis};
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use songbook_storage::path;
use songbook_storage::{Entry, FileMetadata, FolderListing, FolderMetadata, sort_entries};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::{HashSet, VecDeque};
use time::OffsetDateTime;

/// What a save does when a file already exists at the target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRule {
    Replace,
    /// Save under the first free `name (n).ext` instead, unless the contents
    /// are identical.
    Autorename,
    /// Replace only if the stored file still has this rev.
    IfRev(String),
}

/// What a save does when the incoming hash matches the stored file's hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMatchPolicy {
    /// Leave the stored row untouched (metadata, contents and `stored_at`)
    /// and only make sure the file is listed.
    #[default]
    Skip,
    /// Rewrite the metadata and the listing entry, but not the contents.
    Refresh,
}

/// One item of a folder walk: the entry, and its contents if stored.
pub type WalkItem = (Entry, Option<Vec<u8>>);

#[derive(sqlx::FromRow)]
struct FileRowWithContents {
    #[sqlx(flatten)]
    row: FileRow,
    contents: Vec<u8>,
}

/// Repository for stored files and folder listings.
///
/// Anything that may write runs on the database's single writer connection
/// (see [`Database`]); plain lookups run on the readers.
#[derive(Debug, Clone)]
pub struct Repository {
    writer: SqlitePool,
    reader: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { writer: db.writer().clone(), reader: db.reader().clone() }
    }
}
impl Repository {
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    async fn write(&self) -> Result<Transaction<'static, Sqlite>> {
        self.writer.begin().await.or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Store a file and make sure its parent listing (and the parent's
    /// ancestors) list it. Returns the metadata that ends up stored.
    pub async fn save_file(
        &self,
        metadata: FileMetadata,
        contents: &[u8],
        rule: WriteRule,
        policy: HashMatchPolicy,
    ) -> Result<FileMetadata> {
        let mut tx = self.write().await?;
        let saved = save_file(&mut tx, metadata, contents, rule, policy).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(saved)
    }

    /// Replace the listing of `folder` with a remote listing.
    ///
    /// Creates the ancestor chain if needed. Entries that vanished since the
    /// previous listing (or changed between file and folder) are removed from
    /// the cache recursively. A stored file the listing shows with a new rev
    /// and different contents is dropped, so the next load fetches it again;
    /// with the same contents it just takes the listed metadata.
    pub async fn put_listing(&self, folder: &str, mut entries: Vec<Entry>) -> Result<FolderListing> {
        for entry in &entries {
            if path::is_root(entry.path()) || path::dirname(entry.path()) != folder {
                exn::bail!(ErrorKind::BadRequest(format!("`{}` is not a direct child of `{folder}`", entry.path())));
            }
        }
        sort_entries(&mut entries);
        let mut tx = self.write().await?;
        if fetch_file(&mut tx, folder).await?.is_some() {
            exn::bail!(ErrorKind::Conflict(format!("`{folder}` is a file")));
        }
        let previous = ensure_listing(&mut tx, folder).await?;
        for old in &previous {
            let kept = entries.iter().any(|new| new.path() == old.path() && new.is_folder() == old.is_folder());
            if !kept {
                remove_subtree(&mut tx, old.path()).await?;
            }
        }
        // A remote may turn a file into a folder (or back) between listings,
        // or change a file behind the cache's back.
        for entry in &entries {
            match entry {
                Entry::File(file) => {
                    if fetch_listing(&mut tx, &file.path).await?.is_some() {
                        remove_subtree(&mut tx, &file.path).await?;
                    } else if let Some(row) = fetch_file(&mut tx, &file.path).await? {
                        let stored = FileMetadata::try_from(row)?;
                        if stored.same_contents(file) {
                            update_file_metadata(&mut tx, &file.path, file).await?;
                        } else if stored.rev != file.rev {
                            delete_file_row(&mut tx, &file.path).await?;
                        }
                    }
                },
                Entry::Folder(folder) => delete_file_row(&mut tx, &folder.path).await?,
            }
        }
        let stored_at = now_millis();
        write_listing(&mut tx, folder, &entries, stored_at).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(FolderListing {
            stored_at: crate::models::from_millis(stored_at).unwrap_or_else(OffsetDateTime::now_utc),
            path: folder.to_string(),
            files: entries,
        })
    }

    /// Create a folder listing (and its ancestors). An existing folder keeps
    /// its contents.
    pub async fn create_folder(&self, folder: &str) -> Result<FolderMetadata> {
        let mut tx = self.write().await?;
        if fetch_file(&mut tx, folder).await?.is_some() {
            exn::bail!(ErrorKind::Conflict(format!("`{folder}` is a file")));
        }
        ensure_listing(&mut tx, folder).await?;
        let metadata = if path::is_root(folder) {
            FolderMetadata { name: String::new(), path: path::ROOT.to_string(), id: String::new() }
        } else {
            let parent = path::dirname(folder);
            let listed = ensure_listing(&mut tx, parent).await?.into_iter().find(|entry| entry.path() == folder);
            match listed {
                Some(Entry::Folder(existing)) => existing,
                _ => {
                    let stub = folder_stub(folder);
                    insert_entry(&mut tx, parent, Entry::Folder(stub.clone()), true).await?;
                    stub
                },
            }
        };
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(metadata)
    }

    /// Move a file or folder, keeping every structurally dependent row in
    /// step. Never overwrites the destination.
    pub async fn move_entry(&self, from: &str, to: &str) -> Result<Entry> {
        check_relocation(from, to)?;
        let mut tx = self.write().await?;
        let mut entry = lookup_entry(&mut tx, from).await?.ok_or_raise(|| ErrorKind::Miss(from.to_string()))?;
        entry.relocate(to.to_string());
        relocate(&mut tx, from, &entry).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(entry)
    }

    /// Replace what is stored at `old_path` with `entry`, which may live at a
    /// new path (a move reported by a remote) or the same one (fresh metadata).
    pub async fn update_metadata(&self, old_path: &str, entry: Entry) -> Result<Entry> {
        if old_path != entry.path() {
            check_relocation(old_path, entry.path())?;
        }
        let mut tx = self.write().await?;
        let stored = lookup_entry(&mut tx, old_path).await?.ok_or_raise(|| ErrorKind::Miss(old_path.to_string()))?;
        if stored.is_folder() != entry.is_folder() {
            let kind = if stored.is_folder() { "folder" } else { "file" };
            exn::bail!(ErrorKind::Conflict(format!("`{old_path}` is a {kind}")));
        }
        relocate(&mut tx, old_path, &entry).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(entry)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a file, or a folder and everything underneath it.
    pub async fn delete(&self, target: &str) -> Result<()> {
        if path::is_root(target) {
            exn::bail!(ErrorKind::BadRequest("cannot delete the root folder".to_string()));
        }
        let mut tx = self.write().await?;
        if lookup_entry(&mut tx, target).await?.is_none() {
            exn::bail!(ErrorKind::Miss(target.to_string()));
        }
        remove_subtree(&mut tx, target).await?;
        remove_entry(&mut tx, path::dirname(target), target).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Remove everything. The root listing is recreated on the next list.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.write().await?;
        sqlx::query("DELETE FROM files").execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        sqlx::query("DELETE FROM folder_listings").execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn load_file(&self, file: &str) -> Result<StoredFile> {
        let row: Option<FileRowWithContents> = sqlx::query_as(
            r#"
                SELECT path, name, id, client_modified, server_modified, rev, size,
                       is_downloadable, hash, stored_at, contents
                FROM files WHERE path = ?1
            "#,
        )
        .bind(file)
        .fetch_optional(&self.reader)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let FileRowWithContents { row, contents } = row.ok_or_raise(|| ErrorKind::Miss(file.to_string()))?;
        let stored_at = row.stored_at()?;
        Ok(StoredFile { metadata: row.try_into()?, stored_at, contents })
    }

    /// The listing of `folder`. The root listing is created on first use.
    pub async fn list(&self, folder: &str) -> Result<FolderListing> {
        let mut tx = self.write().await?;
        let listing = match fetch_listing(&mut tx, folder).await? {
            Some(row) => FolderListing::try_from(row)?,
            None if path::is_root(folder) => {
                let stored_at = now_millis();
                write_listing(&mut tx, folder, &[], stored_at).await?;
                FolderListing {
                    stored_at: crate::models::from_millis(stored_at).unwrap_or_else(OffsetDateTime::now_utc),
                    path: folder.to_string(),
                    files: Vec::new(),
                }
            },
            None => exn::bail!(ErrorKind::Miss(folder.to_string())),
        };
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(listing)
    }

    /// Every entry underneath `folder`, breadth-first, with the contents of
    /// the files that are stored.
    pub async fn walk(&self, folder: &str) -> Result<Vec<WalkItem>> {
        let mut tx = self.reader.begin().await.or_raise(|| ErrorKind::Database)?;
        if fetch_listing(&mut tx, folder).await?.is_none() && !path::is_root(folder) {
            exn::bail!(ErrorKind::Miss(folder.to_string()));
        }
        let mut items = Vec::new();
        let mut queue = VecDeque::from([folder.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(row) = fetch_listing(&mut tx, &current).await? else { continue };
            for entry in row.entries()? {
                let contents = match &entry {
                    Entry::Folder(child) => {
                        queue.push_back(child.path.clone());
                        None
                    },
                    Entry::File(file) => fetch_contents(&mut tx, &file.path).await?,
                };
                items.push((entry, contents));
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(items)
    }

    /// Returns `true` if a file or a folder listing is stored at `target`.
    pub async fn is_cached(&self, target: &str) -> Result<bool> {
        sqlx::query_scalar(
            r#"
                SELECT EXISTS (SELECT 1 FROM files WHERE path = ?1)
                    OR EXISTS (SELECT 1 FROM folder_listings WHERE path = ?1)
            "#,
        )
        .bind(target)
        .fetch_one(&self.reader)
        .await
        .or_raise(|| ErrorKind::Database)
    }

    pub async fn file_exists(&self, file: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM files WHERE path = ?1)")
            .bind(file)
            .fetch_one(&self.reader)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn file_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.reader)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("file count"))
    }

    /// Sum of stored file sizes, falling back to the stored contents' length
    /// where the metadata has no size. Good enough for a quota display.
    pub async fn approximate_size(&self) -> Result<u64> {
        let size: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CASE WHEN size > 0 THEN size ELSE length(contents) END), 0) FROM files",
        )
        .fetch_one(&self.reader)
        .await
        .or_raise(|| ErrorKind::Database)?;
        u64::try_from(size).or_raise(|| ErrorKind::InvalidData("cache size"))
    }

    /// The subset of `paths` that have a stored file.
    pub async fn cached_paths<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Result<HashSet<String>> {
        let paths: Vec<&str> = paths.into_iter().collect();
        let encoded = serde_json::to_string(&paths).or_raise(|| ErrorKind::InvalidData("path list"))?;
        let rows: Vec<String> = sqlx::query_scalar("SELECT path FROM files WHERE path IN (SELECT value FROM json_each(?1))")
            .bind(encoded)
            .fetch_all(&self.reader)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().collect())
    }
}

// =============================================================================
// Single-statement helpers, always run inside a caller's transaction.
// =============================================================================

/// Matches `?1` itself or anything underneath it.
const WITHIN: &str = "(path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')";
/// Matches anything strictly underneath `?1`.
const BELOW: &str = "substr(path, 1, length(?1) + 1) = ?1 || '/'";

fn folder_stub(folder: &str) -> FolderMetadata {
    FolderMetadata {
        name: path::basename(folder).to_string(),
        path: folder.to_string(),
        id: uuid::Uuid::new_v4().to_string(),
    }
}

fn check_relocation(from: &str, to: &str) -> Result<()> {
    if path::is_root(from) {
        exn::bail!(ErrorKind::BadRequest("cannot move the root folder".to_string()));
    }
    if path::is_root(to) {
        exn::bail!(ErrorKind::BadRequest("cannot replace the root folder".to_string()));
    }
    if path::is_within(to, from) {
        exn::bail!(ErrorKind::BadRequest(format!("cannot move `{from}` into itself")));
    }
    Ok(())
}

async fn fetch_listing(conn: &mut SqliteConnection, folder: &str) -> Result<Option<ListingRow>> {
    sqlx::query_as("SELECT path, stored_at, entries FROM folder_listings WHERE path = ?1")
        .bind(folder)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

async fn write_listing(conn: &mut SqliteConnection, folder: &str, entries: &[Entry], stored_at: i64) -> Result<()> {
    sqlx::query(
        r#"
            INSERT INTO folder_listings (path, stored_at, entries) VALUES (?1, ?2, ?3)
            ON CONFLICT (path) DO UPDATE SET stored_at = excluded.stored_at, entries = excluded.entries
        "#,
    )
    .bind(folder)
    .bind(stored_at)
    .bind(ListingRow::encode(entries)?)
    .execute(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

async fn fetch_file(conn: &mut SqliteConnection, file: &str) -> Result<Option<FileRow>> {
    sqlx::query_as(
        r#"
            SELECT path, name, id, client_modified, server_modified, rev, size,
                   is_downloadable, hash, stored_at
            FROM files WHERE path = ?1
        "#,
    )
    .bind(file)
    .fetch_optional(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)
}

async fn fetch_contents(conn: &mut SqliteConnection, file: &str) -> Result<Option<Vec<u8>>> {
    sqlx::query_scalar("SELECT contents FROM files WHERE path = ?1")
        .bind(file)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

async fn write_file(conn: &mut SqliteConnection, metadata: &FileMetadata, contents: &[u8]) -> Result<()> {
    let row = FileRow::new(metadata, now_millis())?;
    sqlx::query(
        r#"
            INSERT INTO files (
                path, name, id, client_modified, server_modified, rev, size,
                is_downloadable, hash, stored_at, contents
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (path) DO UPDATE SET
                name = excluded.name,
                id = excluded.id,
                client_modified = excluded.client_modified,
                server_modified = excluded.server_modified,
                rev = excluded.rev,
                size = excluded.size,
                is_downloadable = excluded.is_downloadable,
                hash = excluded.hash,
                stored_at = excluded.stored_at,
                contents = excluded.contents
        "#,
    )
    .bind(row.path)
    .bind(row.name)
    .bind(row.id)
    .bind(row.client_modified)
    .bind(row.server_modified)
    .bind(row.rev)
    .bind(row.size)
    .bind(row.is_downloadable)
    .bind(row.hash)
    .bind(row.stored_at)
    .bind(contents)
    .execute(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Rewrite the metadata of the file stored at `old_path` (possibly moving it
/// to `metadata.path`). Contents and `stored_at` are untouched.
async fn update_file_metadata(conn: &mut SqliteConnection, old_path: &str, metadata: &FileMetadata) -> Result<()> {
    let row = FileRow::new(metadata, 0)?;
    sqlx::query(
        r#"
            UPDATE files SET
                path = ?2, name = ?3, id = ?4, client_modified = ?5, server_modified = ?6,
                rev = ?7, size = ?8, is_downloadable = ?9, hash = ?10
            WHERE path = ?1
        "#,
    )
    .bind(old_path)
    .bind(row.path)
    .bind(row.name)
    .bind(row.id)
    .bind(row.client_modified)
    .bind(row.server_modified)
    .bind(row.rev)
    .bind(row.size)
    .bind(row.is_downloadable)
    .bind(row.hash)
    .execute(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

async fn delete_file_row(conn: &mut SqliteConnection, file: &str) -> Result<()> {
    sqlx::query("DELETE FROM files WHERE path = ?1")
        .bind(file)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

// =============================================================================
// Structural helpers
// =============================================================================

/// Entries of `folder`, creating its listing (and any missing ancestors, each
/// registered in its parent) if it does not exist yet.
async fn ensure_listing(conn: &mut SqliteConnection, folder: &str) -> Result<Vec<Entry>> {
    if let Some(row) = fetch_listing(conn, folder).await? {
        return row.entries();
    }
    let mut missing = vec![folder.to_string()];
    let mut current = folder.to_string();
    while !path::is_root(&current) {
        let parent = path::dirname(&current).to_string();
        if fetch_listing(conn, &parent).await?.is_some() {
            break;
        }
        missing.push(parent.clone());
        current = parent;
    }
    // Top-down, so that every parent exists before its child is registered.
    for created in missing.iter().rev() {
        if fetch_file(conn, created).await?.is_some() {
            exn::bail!(ErrorKind::Conflict(format!("`{created}` is a file")));
        }
        write_listing(conn, created, &[], now_millis()).await?;
        if !path::is_root(created) {
            insert_entry(conn, path::dirname(created), Entry::Folder(folder_stub(created)), false).await?;
        }
    }
    Ok(Vec::new())
}

/// Put `entry` into the (existing or empty) listing of `parent`.
///
/// Without `replace`, an entry of the same kind already listed at that path
/// is left as it is.
async fn insert_entry(conn: &mut SqliteConnection, parent: &str, entry: Entry, replace: bool) -> Result<()> {
    let mut entries = match fetch_listing(conn, parent).await? {
        Some(row) => row.entries()?,
        None => Vec::new(),
    };
    match entries.iter().position(|listed| listed.path() == entry.path()) {
        Some(idx) if !replace && entries[idx].is_folder() == entry.is_folder() => return Ok(()),
        Some(idx) => entries[idx] = entry,
        None => entries.push(entry),
    }
    sort_entries(&mut entries);
    write_listing(conn, parent, &entries, now_millis()).await
}

async fn add_to_parent(conn: &mut SqliteConnection, entry: Entry, replace: bool) -> Result<()> {
    let parent = path::dirname(entry.path()).to_string();
    ensure_listing(conn, &parent).await?;
    insert_entry(conn, &parent, entry, replace).await
}

async fn remove_entry(conn: &mut SqliteConnection, parent: &str, target: &str) -> Result<()> {
    let Some(row) = fetch_listing(conn, parent).await? else { return Ok(()) };
    let mut entries = row.entries()?;
    let before = entries.len();
    entries.retain(|entry| entry.path() != target);
    if entries.len() != before {
        write_listing(conn, parent, &entries, now_millis()).await?;
    }
    Ok(())
}

/// What is stored or listed at `target`, if anything.
async fn lookup_entry(conn: &mut SqliteConnection, target: &str) -> Result<Option<Entry>> {
    if let Some(row) = fetch_file(conn, target).await? {
        return Ok(Some(Entry::File(row.try_into()?)));
    }
    let listed = if path::is_root(target) {
        None
    } else {
        match fetch_listing(conn, path::dirname(target)).await? {
            Some(row) => row.entries()?.into_iter().find(|entry| entry.path() == target),
            None => None,
        }
    };
    if fetch_listing(conn, target).await?.is_some() {
        return Ok(Some(match listed {
            Some(Entry::Folder(folder)) => Entry::Folder(folder),
            _ => Entry::Folder(FolderMetadata {
                name: path::basename(target).to_string(),
                path: target.to_string(),
                id: String::new(),
            }),
        }));
    }
    Ok(listed)
}

/// Delete `target` and, breadth-first through the listings, everything
/// underneath it. Does not touch the parent's listing.
async fn remove_subtree(conn: &mut SqliteConnection, target: &str) -> Result<()> {
    delete_file_row(conn, target).await?;
    let mut queue = VecDeque::from([target.to_string()]);
    while let Some(folder) = queue.pop_front() {
        let Some(row) = fetch_listing(conn, &folder).await? else { continue };
        for entry in row.entries()? {
            match entry {
                Entry::Folder(child) => queue.push_back(child.path),
                Entry::File(file) => delete_file_row(conn, &file.path).await?,
            }
        }
        sqlx::query("DELETE FROM folder_listings WHERE path = ?1")
            .bind(&folder)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    }
    if !path::is_root(target) {
        // Rows no listing referenced any more.
        for table in ["files", "folder_listings"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE {BELOW}"))
                .bind(target)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
    }
    Ok(())
}

/// Move every listing at or below `from` under `to`, rewriting the entries
/// they contain, then every stored file below `from`.
async fn rewrite_subtree(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<()> {
    let rows: Vec<ListingRow> = sqlx::query_as(&format!("SELECT path, stored_at, entries FROM folder_listings WHERE {WITHIN}"))
        .bind(from)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    sqlx::query(&format!("DELETE FROM folder_listings WHERE {WITHIN}"))
        .bind(from)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    for row in rows {
        let moved = path::rebase(&row.path, from, to).ok_or_raise(|| ErrorKind::InvalidData("listing outside the moved folder"))?;
        let mut entries = row.entries()?;
        for entry in &mut entries {
            if let Some(rebased) = path::rebase(entry.path(), from, to) {
                entry.relocate(rebased);
            }
        }
        write_listing(conn, &moved, &entries, row.stored_at).await?;
    }
    sqlx::query(&format!("UPDATE files SET path = ?2 || substr(path, length(?1) + 1) WHERE {BELOW}"))
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Make `entry` (at its own path) replace whatever is stored at `from`.
async fn relocate(conn: &mut SqliteConnection, from: &str, entry: &Entry) -> Result<()> {
    let to = entry.path();
    let moving = from != to;
    if moving && lookup_entry(conn, to).await?.is_some() {
        exn::bail!(ErrorKind::Conflict(format!("`{to}` already exists")));
    }
    match entry {
        Entry::File(metadata) => update_file_metadata(conn, from, metadata).await?,
        Entry::Folder(_) if moving => rewrite_subtree(conn, from, to).await?,
        Entry::Folder(_) => {},
    }
    if moving {
        remove_entry(conn, path::dirname(from), from).await?;
    }
    add_to_parent(conn, entry.clone(), true).await
}

async fn save_file(
    conn: &mut SqliteConnection,
    mut incoming: FileMetadata,
    contents: &[u8],
    rule: WriteRule,
    policy: HashMatchPolicy,
) -> Result<FileMetadata> {
    if path::is_root(&incoming.path) {
        exn::bail!(ErrorKind::BadRequest("cannot save a file at the root".to_string()));
    }
    if fetch_listing(conn, &incoming.path).await?.is_some() {
        exn::bail!(ErrorKind::Conflict(format!("`{}` is a folder", incoming.path)));
    }
    let existing = fetch_file(conn, &incoming.path).await?.map(FileMetadata::try_from).transpose()?;
    match (rule, existing) {
        (_, None) => {},
        (_, Some(existing)) if existing.same_contents(&incoming) => {
            return match policy {
                HashMatchPolicy::Skip => {
                    add_to_parent(conn, Entry::File(existing.clone()), false).await?;
                    Ok(existing)
                },
                HashMatchPolicy::Refresh => {
                    update_file_metadata(conn, &existing.path, &incoming).await?;
                    add_to_parent(conn, Entry::File(incoming.clone()), true).await?;
                    Ok(incoming)
                },
            };
        },
        (WriteRule::Autorename, Some(_)) => {
            let free = free_path(conn, &incoming.path).await?;
            incoming.relocate(free);
        },
        (WriteRule::IfRev(rev), Some(existing)) if existing.rev != rev => {
            exn::bail!(ErrorKind::Conflict(format!("`{}` has changed since it was loaded", existing.path)));
        },
        (_, Some(_)) => {},
    }
    write_file(conn, &incoming, contents).await?;
    add_to_parent(conn, Entry::File(incoming.clone()), true).await?;
    Ok(incoming)
}

/// First `name (n).ext` next to `taken` that nothing is stored or listed at.
async fn free_path(conn: &mut SqliteConnection, taken: &str) -> Result<String> {
    let mut n = 1;
    loop {
        let candidate = path::autorename(taken, n);
        if lookup_entry(conn, &candidate).await?.is_none() {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> Repository {
        let db = Database::connect_in_memory().await.unwrap();
        Repository::from(&db)
    }

    fn file(path: &str, contents: &str) -> FileMetadata {
        FileMetadata::local(path, contents.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_deep_save_creates_ancestor_chain() {
        let repo = repo().await;
        repo.save_file(file("/A/B/C/d.txt", "d"), b"d", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        for (folder, child) in [("/", "/A"), ("/A", "/A/B"), ("/A/B", "/A/B/C"), ("/A/B/C", "/A/B/C/d.txt")] {
            let listing = repo.list(folder).await.unwrap();
            let paths: Vec<_> = listing.files.iter().map(Entry::path).collect();
            assert_eq!(paths, [child], "listing of {folder}");
        }
    }

    #[tokio::test]
    async fn test_file_in_the_way_of_a_folder() {
        let repo = repo().await;
        repo.save_file(file("/A", "a"), b"a", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        let err = repo.save_file(file("/A/b", "b"), b"b", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        // Rolled back: nothing of the failed save remains.
        assert!(!repo.file_exists("/A/b").await.unwrap());
        assert_eq!(repo.file_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_if_rev() {
        let repo = repo().await;
        let stored = repo.save_file(file("/a", "1"), b"1", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        let err = repo
            .save_file(file("/a", "2"), b"2", WriteRule::IfRev("stale".into()), HashMatchPolicy::Skip)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        repo.save_file(file("/a", "2"), b"2", WriteRule::IfRev(stored.rev), HashMatchPolicy::Skip).await.unwrap();
        assert_eq!(repo.load_file("/a").await.unwrap().contents, b"2");
    }

    #[tokio::test]
    async fn test_update_metadata_in_place() {
        let repo = repo().await;
        let stored = repo.save_file(file("/a", "1"), b"1", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        let mut renewed = stored.clone();
        renewed.rev = "remote-rev".into();
        repo.update_metadata("/a", Entry::File(renewed)).await.unwrap();
        let loaded = repo.load_file("/a").await.unwrap();
        assert_eq!(loaded.metadata.rev, "remote-rev");
        assert_eq!(loaded.contents, b"1");
        let listing = repo.list("/").await.unwrap();
        assert!(matches!(&listing.files[..], [Entry::File(f)] if f.rev == "remote-rev"));
    }

    #[tokio::test]
    async fn test_update_metadata_missing() {
        let repo = repo().await;
        let err = repo.update_metadata("/gone", Entry::File(file("/gone", ""))).await.unwrap_err();
        assert!(err.is_miss());
    }

    #[tokio::test]
    async fn test_update_metadata_keeps_kind() {
        let repo = repo().await;
        repo.save_file(file("/Setlist/intro.chopro", "x"), b"x", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        let err = repo.update_metadata("/Setlist", Entry::File(file("/Encore.chopro", ""))).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        let folder = FolderMetadata::local("/Encore").unwrap();
        let err = repo.update_metadata("/Setlist/intro.chopro", Entry::Folder(folder)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));

        assert_eq!(repo.load_file("/Setlist/intro.chopro").await.unwrap().contents, b"x");
        let root: Vec<_> = repo.list("/").await.unwrap().files.iter().map(|entry| entry.path().to_string()).collect();
        assert_eq!(root, ["/Setlist"]);
        assert!(!repo.is_cached("/Encore.chopro").await.unwrap());
        assert!(!repo.is_cached("/Encore").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_listing_drops_changed_files() {
        let repo = repo().await;
        let save = |path: &'static str, contents: &'static str| {
            let repo = repo.clone();
            async move {
                repo.save_file(file(path, contents), contents.as_bytes(), WriteRule::Replace, HashMatchPolicy::Skip)
                    .await
                    .unwrap()
            }
        };
        let kept = save("/Folk/kept.chopro", "kept").await;
        save("/Folk/edited.chopro", "old chorus").await;
        let mut renewed = save("/Folk/renewed.chopro", "same").await;
        renewed.rev = "remote-rev".into();

        let listing = vec![
            Entry::File(kept.clone()),
            Entry::File(file("/Folk/edited.chopro", "new chorus")),
            Entry::File(renewed),
        ];
        repo.put_listing("/Folk", listing).await.unwrap();

        assert_eq!(repo.load_file("/Folk/kept.chopro").await.unwrap().metadata.rev, kept.rev);
        assert!(repo.load_file("/Folk/edited.chopro").await.unwrap_err().is_miss());
        let loaded = repo.load_file("/Folk/renewed.chopro").await.unwrap();
        assert_eq!(loaded.metadata.rev, "remote-rev");
        assert_eq!(loaded.contents, b"same");
        assert_eq!(repo.list("/Folk").await.unwrap().files.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("cache.sqlite")).await.unwrap();
        let repo = Repository::from(&db);

        let mut tasks = Vec::new();
        for n in 0..40 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                let song = format!("/Set {}/song {n}.chopro", n % 4);
                let contents = format!("{{title: Song {n}}}");
                repo.save_file(file(&song, &contents), contents.as_bytes(), WriteRule::Replace, HashMatchPolicy::Skip)
                    .await
                    .map(|_| ())
            }));
        }
        for n in 0..8 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                let listed = Entry::File(file(&format!("/Remote/tune {n}.chopro"), "remote"));
                repo.put_listing("/Remote", vec![listed]).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(repo.file_count().await.unwrap(), 40);
        for set in 0..4 {
            assert_eq!(repo.list(&format!("/Set {set}")).await.unwrap().files.len(), 10);
        }
        assert_eq!(repo.list("/Remote").await.unwrap().files.len(), 1);
        let root: HashSet<String> = repo.list("/").await.unwrap().files.iter().map(|entry| entry.path().to_string()).collect();
        assert_eq!(root, HashSet::from(["/Remote", "/Set 0", "/Set 1", "/Set 2", "/Set 3"].map(String::from)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_cached_paths() {
        let repo = repo().await;
        repo.save_file(file("/a", "a"), b"a", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        repo.save_file(file("/b (1)", "b"), b"b", WriteRule::Replace, HashMatchPolicy::Skip).await.unwrap();
        let cached = repo.cached_paths(["/a", "/b (1)", "/c"]).await.unwrap();
        assert_eq!(cached, HashSet::from(["/a".to_string(), "/b (1)".to_string()]));
        assert!(repo.cached_paths(Vec::<&str>::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_listing_rejects_grandchildren() {
        let repo = repo().await;
        let err = repo.put_listing("/A", vec![Entry::File(file("/A/B/c", ""))]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
    }
}
