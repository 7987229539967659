use crate::error::{ErrorKind, Result, store_error};
use crate::message::Operation;
use crate::reconcile::{Reconciled, reconcile};
use async_stream::stream;
use futures::Stream;
use songbook_storage::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, StoreHandle, TextFile};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic request counter.
///
/// Every request takes a [`Ticket`]; a result whose ticket is no longer the
/// latest belongs to a request the user has already moved on from.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, superseding every earlier one.
    pub fn next(&self) -> Ticket {
        let value = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket { generation: self.clone(), value }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Ticket {
    generation: Generation,
    value: u64,
}

impl Ticket {
    pub fn is_current(&self) -> bool {
        self.generation.current() == self.value
    }

    /// `Err(Superseded)` once a newer request has started.
    pub fn check(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            exn::bail!(ErrorKind::Superseded)
        }
    }
}

/// The active file store plus the request bookkeeping around it.
///
/// Reads go cache-first through [`reconcile`]; writes go straight to the
/// store, which mirrors them into its cache. Results of reads that were
/// superseded by a newer read are dropped.
#[derive(Clone)]
pub struct Session {
    store: StoreHandle,
    reads: Generation,
}

impl Session {
    pub fn new(store: StoreHandle) -> Self {
        Self { store, reads: Generation::new() }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Name of the active backend, for user-facing messages.
    pub fn backend(&self) -> &str {
        self.store.name()
    }

    /// Swap the active store. Reads still in flight against the old one are
    /// superseded.
    pub fn replace_store(&mut self, store: StoreHandle) {
        tracing::info!(from = self.store.name(), to = store.name(), "Switching file store");
        self.store = store;
        self.reads.next();
    }

    pub fn list_files(&self, path: &str) -> impl Stream<Item = Reconciled<Vec<Entry>>> + 'static {
        let ticket = self.reads.next();
        let store = self.store.clone();
        let path = path.to_string();
        let cached = store.cache().cloned().map(|cache| {
            let path = path.clone();
            async move { cache.list_files(&path).await }
        });
        let network = async move { store.list_files(&path).await };
        current_only(ticket, reconcile(cached, network))
    }

    pub fn load_text(&self, path: &str) -> impl Stream<Item = Reconciled<TextFile>> + 'static {
        let ticket = self.reads.next();
        let store = self.store.clone();
        let path = path.to_string();
        let cached = store.cache().cloned().map(|cache| {
            let path = path.clone();
            async move { cache.load_text(&path).await }
        });
        let network = async move { store.load_text(&path).await };
        current_only(ticket, reconcile(cached, network))
    }

    pub fn load_blob(&self, path: &str) -> impl Stream<Item = Reconciled<BlobFile>> + 'static {
        let ticket = self.reads.next();
        let store = self.store.clone();
        let path = path.to_string();
        let cached = store.cache().cloned().map(|cache| {
            let path = path.clone();
            async move { cache.load_blob(&path).await }
        });
        let network = async move { store.load_blob(&path).await };
        current_only(ticket, reconcile(cached, network))
    }

    pub async fn save_text(&self, target: SaveTarget, mode: SaveMode, text: &str) -> Result<FileMetadata> {
        let path = target.path().to_string();
        self.store.save_text(target, mode, text).await.map_err(|err| store_error(Operation::Save, &path, err))
    }

    pub async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let path = target.path().to_string();
        self.store.save_blob(target, mode, contents).await.map_err(|err| store_error(Operation::Save, &path, err))
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<Entry> {
        self.store.move_entry(from, to).await.map_err(|err| store_error(Operation::Move, from, err))
    }

    pub async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        self.store.create_folder(path).await.map_err(|err| store_error(Operation::Create, path, err))
    }

    pub async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        self.store.compress_folder(path).await.map_err(|err| store_error(Operation::Compress, path, err))
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(path).await.map_err(|err| store_error(Operation::Delete, path, err))
    }
}

/// Pass events through until the ticket is superseded.
fn current_only<T>(ticket: Ticket, events: impl Stream<Item = T>) -> impl Stream<Item = T> {
    stream! {
        for await event in events {
            if !ticket.is_current() {
                tracing::debug!("Dropping the result of a superseded request");
                return;
            }
            yield event;
        }
    }
}
