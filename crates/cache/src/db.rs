//! Offline cache database: one writer connection, a pool of readers.
//!
//! Write-through mirrors run as independent tasks, so several cache writes can
//! be in flight at once. SQLite allows a single writer, and a deferred
//! transaction that starts reading and then upgrades to a write lock fails with
//! `SQLITE_BUSY` immediately (the busy timeout does not apply to the upgrade).
//! Every write therefore goes through a pool of exactly one connection, where
//! writers queue for the connection instead of racing for the lock. Readers run
//! on their own `query_only` pool and never block the writer under WAL.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
/// Cache-first loads and listings run concurrently with a mirror write.
const READERS: u32 = 4;
/// Readers only wait on WAL checkpoints; this is generous.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Connection pools of the offline cache, shared by every
/// [`Repository`](crate::Repository) created from it.
#[derive(Debug, Clone)]
pub struct Database {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Database {
    /// Open (or create) the cache database file at `path` and bring its
    /// schema up to date. The parent directory must exist.
    #[instrument("opening offline cache", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::options().filename(path.as_ref());
        let writer = Self::pool(options.clone().create_if_missing(true), 1).await?;
        Self::migrate(&writer).await?;
        let reader = Self::pool(options.pragma("query_only", "ON"), READERS).await?;
        Ok(Self { writer, reader })
    }

    /// A private in-memory cache, gone once closed.
    ///
    /// Every connection to `:memory:` is a database of its own, so readers and
    /// the writer share the single connection. Not `#[cfg(test)]`, other crates
    /// use it in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let writer = Self::pool(Self::options().filename(":memory:"), 1).await?;
        Self::migrate(&writer).await?;
        Ok(Self { reader: writer.clone(), writer })
    }

    fn options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            // The remote is authoritative; losing the last cache write on
            // power loss only costs a refetch.
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            // Deleted blobs leave free pages that the next save reuses.
            .auto_vacuum(SqliteAutoVacuum::None)
    }

    async fn pool(options: SqliteConnectOptions, size: u32) -> Result<SqlitePool> {
        SqlitePoolOptions::new()
            .max_connections(size)
            // Connection-level PRAGMAs, so they have to run on every new
            // connection of the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::tune(conn, meta).await }))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    async fn tune(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        // Song sheets are small: a modest page cache and a WAL that is
        // checkpointed before it grows past a few megabytes.
        sqlx::query("PRAGMA wal_autocheckpoint = 800; PRAGMA cache_size = -8192; PRAGMA temp_store = MEMORY;")
            .execute(conn)
            .await?;
        Ok(())
    }

    #[instrument("migrating offline cache schema", skip_all)]
    async fn migrate(writer: &SqlitePool) -> Result<()> {
        MIGRATOR.run(writer).await.or_raise(|| ErrorKind::Migration)
    }

    /// The single-connection pool every write transaction runs on.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// The pool for plain reads. Writes on it fail (`query_only`) for
    /// file-backed databases.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Close both pools, after letting SQLite refresh its planner statistics.
    /// The database must not be used afterwards.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.writer).await;
        self.reader.close().await;
        self.writer.close().await;
    }
}
