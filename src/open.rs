//! Turning configuration into live stores.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use songbook_cache::{Database, OfflineCache};
use songbook_config::{BackendConfig, CacheConfig};
use songbook_storage::backend::dropbox::{AccessToken, DropboxClient, DropboxCredentials, DropboxStore};
use songbook_storage::backend::{LocalStore, S3Store, ServerStore};
use songbook_storage::{CacheHandle, StoreHandle, WriteThrough};
use std::sync::Arc;

/// The configured store, plus a handle on its pending cache writes.
pub struct Opened {
    pub store: StoreHandle,
    pub writes: WriteThrough,
}

pub async fn open_cache(config: &CacheConfig) -> Result<Option<Arc<OfflineCache>>> {
    if !config.enabled {
        return Ok(None);
    }
    let location = config.path.display().to_string();
    if let Some(parent) = config.path.parent() {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Cache(location.clone()))?;
    }
    let db = Database::connect(&config.path).await.or_raise(|| ErrorKind::Cache(location.clone()))?;
    tracing::debug!(path = %location, policy = ?config.on_hash_match, "Opened the offline cache");
    Ok(Some(Arc::new(OfflineCache::new(&db).with_policy(config.on_hash_match))))
}

pub async fn open_store(config: &BackendConfig, cache: Option<CacheHandle>) -> Result<Opened> {
    let name = config.name();
    match config {
        BackendConfig::Local { root } => {
            let store = LocalStore::new(name, root).or_raise(|| ErrorKind::Backend(name))?;
            let store = attach(store, cache, LocalStore::with_cache);
            Ok(Opened { writes: store.write_through().clone(), store: Arc::new(store) })
        },
        BackendConfig::Server { url } => {
            let store = ServerStore::new(name, url.as_str()).or_raise(|| ErrorKind::Backend(name))?;
            let store = attach(store, cache, ServerStore::with_cache);
            Ok(Opened { writes: store.write_through().clone(), store: Arc::new(store) })
        },
        BackendConfig::Dropbox { client_id, access_token, refresh_token } => {
            let credentials = DropboxCredentials {
                client_id: client_id.clone(),
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
            };
            let client = DropboxClient::new(credentials)
                .or_raise(|| ErrorKind::Backend(name))?
                .on_refresh(Arc::new(|token: &AccessToken| {
                    tracing::info!(
                        expires_in = ?token.expires_in,
                        "Dropbox access token refreshed; set backend.access_token to keep using it"
                    );
                }));
            let store = attach(DropboxStore::new(name, client), cache, DropboxStore::with_cache);
            Ok(Opened { writes: store.write_through().clone(), store: Arc::new(store) })
        },
        BackendConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let store = S3Store::new(
                name,
                bucket.as_str(),
                prefix.clone(),
                region.as_str(),
                endpoint.clone(),
                key_id.as_str(),
                key_secret.as_str(),
            )
            .await
            .or_raise(|| ErrorKind::Backend(name))?;
            let store = attach(store, cache, S3Store::with_cache);
            Ok(Opened { writes: store.write_through().clone(), store: Arc::new(store) })
        },
    }
}

fn attach<S>(store: S, cache: Option<CacheHandle>, with_cache: fn(S, CacheHandle) -> S) -> S {
    match cache {
        Some(cache) => with_cache(store, cache),
        None => store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use songbook_cache::HashMatchPolicy;
    use songbook_storage::{FileStore, SaveMode};

    #[tokio::test]
    async fn test_disabled_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            CacheConfig { path: dir.path().join("cache.sqlite"), enabled: false, on_hash_match: HashMatchPolicy::Skip };
        assert!(open_cache(&config).await.unwrap().is_none());
        assert!(!config.path.exists());
    }

    #[tokio::test]
    async fn test_local_store_mirrors_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            path: dir.path().join("nested/cache.sqlite"),
            enabled: true,
            on_hash_match: HashMatchPolicy::Refresh,
        };
        let cache = open_cache(&config).await.unwrap().unwrap();
        assert_eq!(cache.policy(), HashMatchPolicy::Refresh);

        let root = dir.path().join("files");
        std::fs::create_dir(&root).unwrap();
        let handle: CacheHandle = cache.clone();
        let opened = open_store(&BackendConfig::Local { root }, Some(handle)).await.unwrap();
        assert_eq!(opened.store.name(), "local");
        opened.store.save_text("/a.chopro".into(), SaveMode::Overwrite, "{t:A}").await.unwrap();
        opened.writes.settle().await;
        assert_eq!(cache.load_text("/a.chopro").await.unwrap().text, "{t:A}");
    }
}
