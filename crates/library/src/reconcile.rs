//! Cache-versus-network reconciliation.
//!
//! A read is sent to the offline cache and to the remote at the same time.
//! Whatever the cache has is shown straight away; the remote's answer then
//! either replaces it or, when it carries the same contents, is dropped so
//! the consumer has nothing to redraw.

use async_stream::stream;
use futures::Stream;
use futures::future::{self, Either};
use songbook_storage::error::{Error as StorageError, Result as StorageResult};
use songbook_storage::{BlobFile, Entry, TextFile, log_cache_error};
use std::future::Future;
use std::pin::pin;

/// Events emitted by [`reconcile`].
///
/// Events follow a strict ordering:
/// 1. [`Provisional`](Self::Provisional): at most once, and only if the cache
///    answered before the network did.
/// 2. Exactly one of [`Fresh`](Self::Fresh), [`Unchanged`](Self::Unchanged)
///    or [`Failed`](Self::Failed).
#[derive(Debug)]
pub enum Reconciled<T> {
    /// The cached value, shown until the network answers.
    Provisional(T),
    /// The authoritative value, different from whatever was shown.
    Fresh(T),
    /// The network agreed with the provisional value; do nothing.
    Unchanged,
    /// The network request failed. Any provisional value stays on screen.
    Failed(StorageError),
}

impl<T> Reconciled<T> {
    /// The value to display, if this event carries one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Provisional(value) | Self::Fresh(value) => Some(value),
            Self::Unchanged | Self::Failed(_) => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Provisional(_))
    }
}

/// Values that can tell whether a newer copy is the same as an older one.
pub trait Reconcile {
    fn same_as(&self, shown: &Self) -> bool;
}

impl Reconcile for TextFile {
    fn same_as(&self, shown: &Self) -> bool {
        self.metadata.path == shown.metadata.path && self.metadata.same_contents(&shown.metadata)
    }
}

impl Reconcile for BlobFile {
    fn same_as(&self, shown: &Self) -> bool {
        self.metadata.path == shown.metadata.path && self.metadata.same_contents(&shown.metadata)
    }
}

/// Listings match when every entry matches; a file entry with an empty hash
/// never does.
impl Reconcile for Vec<Entry> {
    fn same_as(&self, shown: &Self) -> bool {
        self.len() == shown.len()
            && self.iter().zip(shown).all(|pair| match pair {
                (Entry::File(a), Entry::File(b)) => a.path == b.path && a.same_contents(b),
                (Entry::Folder(a), Entry::Folder(b)) => a == b,
                _ => false,
            })
    }
}

/// Race `cached` against `network` and stream what the consumer should show.
///
/// A cache read that fails is logged and ignored. A cache read that finishes
/// after the network is discarded, unless the network failed: then the cached
/// value is still worth showing (offline), so it is emitted as provisional
/// before the failure.
pub fn reconcile<'a, T, C, N>(cached: Option<C>, network: N) -> impl Stream<Item = Reconciled<T>> + 'a
where
    T: Reconcile + Clone + Send + 'a,
    C: Future<Output = StorageResult<T>> + Send + 'a,
    N: Future<Output = StorageResult<T>> + Send + 'a,
{
    stream! {
        let mut network = pin!(network);
        let shown = match cached {
            None => None,
            Some(cached) => {
                let cached = pin!(cached);
                match future::select(cached, network.as_mut()).await {
                    Either::Left((Ok(value), _)) => {
                        yield Reconciled::Provisional(value.clone());
                        Some(value)
                    },
                    Either::Left((Err(err), _)) => {
                        log_cache_error(&err);
                        None
                    },
                    Either::Right((Ok(value), _)) => {
                        yield Reconciled::Fresh(value);
                        return;
                    },
                    Either::Right((Err(err), cached)) => {
                        match cached.await {
                            Ok(value) => yield Reconciled::Provisional(value),
                            Err(cache_err) => log_cache_error(&cache_err),
                        }
                        yield Reconciled::Failed(err);
                        return;
                    },
                }
            },
        };
        match network.await {
            Ok(value) if shown.as_ref().is_some_and(|shown| value.same_as(shown)) => {
                tracing::trace!("Network result matches the cached one");
                yield Reconciled::Unchanged;
            },
            Ok(value) => yield Reconciled::Fresh(value),
            Err(err) => yield Reconciled::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use songbook_storage::FileMetadata;
    use songbook_storage::error::ErrorKind;
    use std::time::Duration;

    fn text(path: &str, contents: &str) -> TextFile {
        TextFile { metadata: FileMetadata::local(path, contents.as_bytes()).unwrap(), text: contents.to_string() }
    }

    async fn after<T>(ms: u64, value: StorageResult<T>) -> StorageResult<T> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        value
    }

    fn not_found<T>() -> StorageResult<T> {
        Err(exn::Exn::from(ErrorKind::NotFound("/a".into())))
    }

    fn offline<T>() -> StorageResult<T> {
        Err(exn::Exn::from(ErrorKind::Network("offline".into())))
    }

    async fn collect<T>(stream: impl Stream<Item = Reconciled<T>>) -> Vec<Reconciled<T>> {
        stream.collect().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_hash_is_unchanged() {
        let cached = text("/a", "{t:A}");
        // Different rev and id, same contents.
        let remote = text("/a", "{t:A}");
        let events = collect(reconcile(Some(after(1, Ok(cached.clone()))), after(10, Ok(remote)))).await;
        assert!(matches!(&events[..], [Reconciled::Provisional(shown), Reconciled::Unchanged] if *shown == cached));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_hash_supersedes() {
        let cached = text("/a", "{t:A}");
        let remote = text("/a", "{t:B}");
        let events = collect(reconcile(Some(after(1, Ok(cached))), after(10, Ok(remote.clone())))).await;
        assert!(matches!(&events[..], [Reconciled::Provisional(_), Reconciled::Fresh(fresh)] if *fresh == remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_hashes_never_match() {
        let mut cached = text("/a", "{t:A}");
        cached.metadata.hash = String::new();
        let remote = cached.clone();
        let events = collect(reconcile(Some(after(1, Ok(cached))), after(10, Ok(remote)))).await;
        assert!(matches!(&events[..], [Reconciled::Provisional(_), Reconciled::Fresh(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_cache_is_discarded() {
        let remote = text("/a", "{t:B}");
        let events = collect(reconcile(Some(after(10, Ok(text("/a", "{t:A}")))), after(1, Ok(remote.clone())))).await;
        assert!(matches!(&events[..], [Reconciled::Fresh(fresh)] if *fresh == remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_miss_falls_through() {
        let remote = text("/a", "{t:B}");
        let events = collect(reconcile(Some(after(1, not_found())), after(10, Ok(remote)))).await;
        assert!(matches!(&events[..], [Reconciled::Fresh(_)]));
        let events = collect(reconcile(None::<std::future::Ready<StorageResult<TextFile>>>, after(1, not_found()))).await;
        assert!(matches!(&events[..], [Reconciled::Failed(err)] if err.is_not_found()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_keeps_cached_value() {
        let cached = text("/a", "{t:A}");
        let events = collect(reconcile(Some(after(10, Ok(cached.clone()))), after(1, offline::<TextFile>()))).await;
        assert!(matches!(&events[..], [Reconciled::Provisional(shown), Reconciled::Failed(_)] if *shown == cached));
        assert!(events[1].is_final());
        assert!(events[1].value().is_none());
    }

    #[test]
    fn test_listing_comparison() {
        let a = vec![Entry::File(text("/a", "1").metadata)];
        let same = vec![Entry::File(text("/a", "1").metadata)];
        let changed = vec![Entry::File(text("/a", "2").metadata)];
        assert!(same.same_as(&a));
        assert!(!changed.same_as(&a));
        assert!(!Vec::<Entry>::new().same_as(&a));
    }
}
