//! One function per subcommand. Reads go through [`Session`], so an offline
//! copy is shown when the backend cannot be reached.

use crate::cli::{CacheCommand, Mode};
use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use futures::{Stream, StreamExt};
use songbook_cache::OfflineCache;
use songbook_library::error::Error as LibraryError;
use songbook_library::{Operation, Reconciled, Session, describe, failure_message};
use songbook_storage::path;
use songbook_storage::{Entry, SaveTarget};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub async fn ls(session: &Session, cache: Option<&OfflineCache>, path: &str) -> Result<()> {
    let entries = resolve(session.list_files(path), Operation::List, path, session.backend()).await?;
    let offline = match cache {
        Some(cache) => cache.cached_paths(&entries).await.unwrap_or_else(|err| {
            songbook_storage::log_cache_error(&err);
            Default::default()
        }),
        None => Default::default(),
    };
    for entry in &entries {
        let marker = if offline.contains(entry.path()) { '*' } else { ' ' };
        match entry {
            Entry::Folder(folder) => println!("{marker} {:>10}  {}/", "-", folder.name),
            Entry::File(file) => println!("{marker} {:>10}  {}", file.size, file.name),
        }
    }
    Ok(())
}

pub async fn cat(session: &Session, path: &str) -> Result<()> {
    let file = resolve(session.load_blob(path), Operation::Load, path, session.backend()).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&file.blob).await.or_raise(|| ErrorKind::WriteLocal("stdout".to_string()))?;
    stdout.flush().await.or_raise(|| ErrorKind::WriteLocal("stdout".to_string()))
}

pub async fn put(session: &Session, source: &Path, path: &str, mode: Mode) -> Result<()> {
    let contents = tokio::fs::read(source).await.or_raise(|| ErrorKind::ReadLocal(source.display().to_string()))?;
    let target = match mode {
        // Update against the revision the store (or the offline copy) knows.
        Mode::Update => {
            let current = resolve(session.load_blob(path), Operation::Load, path, session.backend()).await?;
            SaveTarget::Metadata(current.metadata)
        },
        Mode::Overwrite | Mode::Add => SaveTarget::from(path),
    };
    let saved = session.save_blob(target, mode.into(), contents).await.map_err(failed(session.backend()))?;
    println!("{} ({} bytes, rev {})", saved.path, saved.size, saved.rev);
    Ok(())
}

pub async fn mv(session: &Session, from: &str, to: &str) -> Result<()> {
    let entry = session.move_entry(from, to).await.map_err(failed(session.backend()))?;
    println!("{}", entry.path());
    Ok(())
}

pub async fn mkdir(session: &Session, path: &str) -> Result<()> {
    let folder = session.create_folder(path).await.map_err(failed(session.backend()))?;
    println!("{}/", folder.path);
    Ok(())
}

pub async fn rm(session: &Session, path: &str) -> Result<()> {
    session.delete(path).await.map_err(failed(session.backend()))
}

pub async fn zip(session: &Session, path: &str, output: Option<PathBuf>) -> Result<()> {
    let archive = session.compress_folder(path).await.map_err(failed(session.backend()))?;
    let output = output.unwrap_or_else(|| PathBuf::from(archive_file_name(path)));
    tokio::fs::write(&output, &archive).await.or_raise(|| ErrorKind::WriteLocal(output.display().to_string()))?;
    println!("{} ({} bytes)", output.display(), archive.len());
    Ok(())
}

pub async fn cache(cache: Option<&OfflineCache>, command: CacheCommand) -> Result<()> {
    let cache = cache.ok_or_raise(|| ErrorKind::CacheDisabled)?;
    match command {
        CacheCommand::Stats => {
            let unreadable = || ErrorKind::Failed("Unable to read the offline cache.".to_string());
            let files = cache.file_count().await.or_raise(unreadable)?;
            let bytes = cache.approximate_size().await.or_raise(unreadable)?;
            println!("{files} files, about {bytes} bytes");
        },
        CacheCommand::Clear => {
            cache.clear().await.or_raise(|| ErrorKind::Failed("Unable to clear the offline cache.".to_string()))?;
            println!("Offline cache cleared");
        },
    }
    Ok(())
}

/// Wait for the value to show: the fresh one, or the offline copy if the
/// network could not confirm it.
async fn resolve<T>(
    events: impl Stream<Item = Reconciled<T>>,
    op: Operation,
    path: &str,
    backend: &str,
) -> Result<T> {
    let mut events = std::pin::pin!(events);
    let mut shown = None;
    while let Some(event) = events.next().await {
        match event {
            Reconciled::Provisional(value) => shown = Some(value),
            Reconciled::Fresh(value) => return Ok(value),
            Reconciled::Unchanged => break,
            Reconciled::Failed(err) => {
                let message = failure_message(op, path, &err, backend);
                return match shown {
                    Some(value) => {
                        tracing::warn!(path, error = ?err, "Showing the offline copy");
                        eprintln!("{message} Showing the offline copy.");
                        Ok(value)
                    },
                    None => Err(err.raise(ErrorKind::Failed(message))),
                };
            },
        }
    }
    shown.ok_or_raise(|| ErrorKind::Superseded)
}

fn failed(backend: &str) -> impl FnOnce(LibraryError) -> Error + '_ {
    move |err| match describe(&err, backend) {
        Some(message) => err.raise(ErrorKind::Failed(message)),
        None => err.raise(ErrorKind::Superseded),
    }
}

fn archive_file_name(folder: &str) -> String {
    match path::basename(folder) {
        "" => "files.zip".to_string(),
        name => format!("{name}.zip"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use rstest::rstest;
    use songbook_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};

    fn network_down() -> StorageError {
        StorageError::from(StorageErrorKind::Network("dns".to_string()))
    }

    #[tokio::test]
    async fn test_resolve_prefers_fresh() {
        let events = stream::iter([Reconciled::Provisional(1), Reconciled::Fresh(2)]);
        assert_eq!(resolve(events, Operation::Load, "/a", "local").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resolve_keeps_unchanged_provisional() {
        let events = stream::iter([Reconciled::Provisional(1), Reconciled::Unchanged]);
        assert_eq!(resolve(events, Operation::Load, "/a", "local").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_offline_copy() {
        let events = stream::iter([Reconciled::Provisional(1), Reconciled::Failed(network_down())]);
        assert_eq!(resolve(events, Operation::Load, "/a", "local").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_reports_failure_for_the_user() {
        let events = stream::iter([Reconciled::<u8>::Failed(network_down())]);
        let err = resolve(events, Operation::List, "/Songs", "Dropbox").await.unwrap_err();
        assert_eq!((*err).to_string(), "Unable to list `/Songs`. Unable to connect to the internet. Try again?");
    }

    #[tokio::test]
    async fn test_resolve_superseded() {
        let events = stream::iter(Vec::<Reconciled<u8>>::new());
        let err = resolve(events, Operation::Load, "/a", "local").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Superseded));
    }

    #[rstest]
    #[case("/", "files.zip")]
    #[case("/Songs", "Songs.zip")]
    #[case("/Songs/Encores", "Encores.zip")]
    fn test_archive_file_name(#[case] folder: &str, #[case] expected: &str) {
        assert_eq!(archive_file_name(folder), expected);
    }
}
