//! Best-effort write-through into an attached offline cache.

use crate::error::Result;
use crate::store::CacheHandle;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Mirrors successful remote operations into a cache without making the
/// caller wait for (or care about) the cache.
///
/// Mirror writes run as spawned tasks; failures are logged and dropped. Two
/// overlapping mirrors of the same path are last-write-wins. [`settle`]
/// exists for tests and shutdown, where the pending writes need to land.
///
/// [`settle`]: WriteThrough::settle
#[derive(Clone, Default)]
pub struct WriteThrough {
    cache: Option<CacheHandle>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WriteThrough {
    pub fn new(cache: Option<CacheHandle>) -> Self {
        Self { cache, pending: Arc::default() }
    }

    pub fn cache(&self) -> Option<&CacheHandle> {
        self.cache.as_ref()
    }

    /// Run `op` against the cache in the background. No-op without a cache.
    pub fn mirror<F, Fut, T>(&self, op: &'static str, path: &str, f: F)
    where
        F: FnOnce(CacheHandle) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let path = path.to_string();
        let fut = f(cache);
        let handle = tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::warn!(op, path = %path, error = ?err, "Failed to mirror into the offline cache");
            }
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    /// Wait for every mirror write issued so far.
    pub async fn settle(&self) {
        let handles: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain(..).collect()
        };
        for handle in handles {
            // A panicking mirror task is as ignorable as a failing one.
            _ = handle.await;
        }
    }
}

impl std::fmt::Debug for WriteThrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteThrough").field("cache", &self.cache.as_ref().map(|c| c.name())).finish()
    }
}
