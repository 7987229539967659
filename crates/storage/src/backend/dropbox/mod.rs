//! Dropbox file store.
//!
//! Dropbox assigns ids, revs and content hashes itself; they are passed
//! through untouched. Its content hash is not SHA-256 of the whole file, but
//! it is consistent for Dropbox, which is all the cache comparison needs.

mod client;
mod models;

pub use self::client::{API_URL, AccessToken, CONTENT_URL, DropboxClient, DropboxCredentials, TokenCallback};

use self::models::WriteMode;
use crate::error::{ErrorKind, Result};
use crate::mirror::WriteThrough;
use crate::models::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, sort_entries};
use crate::path::{self, canonicalize};
use crate::store::{CacheHandle, FileStore};
use async_trait::async_trait;
use exn::OptionExt;

/// Dropbox addresses its root as the empty string.
fn api_path(path: &str) -> &str {
    if path::is_root(path) { "" } else { path }
}

pub struct DropboxStore {
    name: String,
    client: DropboxClient,
    writes: WriteThrough,
}

impl DropboxStore {
    pub fn new(name: impl Into<String>, client: DropboxClient) -> Self {
        Self { name: name.into(), client, writes: WriteThrough::default() }
    }

    pub fn with_cache(mut self, cache: CacheHandle) -> Self {
        self.writes = WriteThrough::new(Some(cache));
        self
    }

    pub fn write_through(&self) -> &WriteThrough {
        &self.writes
    }

    pub fn client(&self) -> &DropboxClient {
        &self.client
    }
}

#[async_trait]
impl FileStore for DropboxStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let path = canonicalize(target.path())?;
        let mode = match mode {
            SaveMode::Add => WriteMode::Add,
            SaveMode::Overwrite => WriteMode::Overwrite,
            SaveMode::Update => {
                let rev = target.metadata().map(|metadata| metadata.rev.clone()).ok_or_raise(|| {
                    ErrorKind::BadRequest("an update needs the metadata of the revision it replaces".to_string())
                })?;
                WriteMode::Update { update: rev }
            },
        };
        let metadata = FileMetadata::try_from(self.client.upload(&path, mode, &contents).await?)?;

        let mirrored = metadata.clone();
        self.writes.mirror("save_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.into(), SaveMode::Overwrite, contents).await
        });
        Ok(metadata)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        let path = canonicalize(path)?;
        let (file, blob) = self.client.download(&path).await?;
        let file = BlobFile { metadata: file.try_into()?, blob };

        let mirrored = file.clone();
        self.writes.mirror("load_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.metadata.into(), SaveMode::Overwrite, mirrored.blob).await
        });
        Ok(file)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        let path = canonicalize(path)?;
        let mut entries = Vec::new();
        for entry in self.client.list_folder(api_path(&path)).await? {
            if let Some(entry) = entry.normalize()? {
                entries.push(entry);
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
        let from = canonicalize(from)?;
        let to = canonicalize(to)?;
        let entry = self
            .client
            .move_v2(&from, &to)
            .await?
            .normalize()?
            .ok_or_raise(|| ErrorKind::InvalidData(format!("Dropbox moved `{from}` into nothing")))?;

        let (source, destination) = (from.clone(), to);
        self.writes.mirror("move_entry", &from, move |cache| async move {
            cache.move_entry(&source, &destination).await
        });
        Ok(entry)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let path = canonicalize(path)?;
        let folder = match self.client.create_folder_v2(&path).await {
            Ok(folder) => FolderMetadata::try_from(folder)?,
            // Dropbox refuses to create a folder that exists; an existing
            // folder is exactly what the caller asked for.
            Err(err) if matches!(&*err, ErrorKind::Conflict(summary) if summary.contains("conflict/folder")) => {
                FolderMetadata { name: path::basename(&path).to_string(), path: path.clone(), id: String::new() }
            },
            Err(err) => return Err(err),
        };

        let created = path.clone();
        self.writes.mirror("create_folder", &path, move |cache| async move {
            cache.create_folder(&created).await
        });
        Ok(folder)
    }

    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        let path = canonicalize(path)?;
        self.client.download_zip(api_path(&path)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = canonicalize(path)?;
        self.client.delete_v2(&path).await?;

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
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Stub {
        refreshes: AtomicUsize,
        listings: AtomicUsize,
    }

    async fn list_folder(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
        stub.listings.fetch_add(1, Ordering::SeqCst);
        let authorized = headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer fresh");
        if !authorized {
            let body = json!({"error_summary": "expired_access_token/", "error": {".tag": "expired_access_token"}});
            return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
        }
        let body = json!({
            "entries": [
                {".tag": "file", "name": "b.chopro", "id": "id:b", "path_display": "/Songs/b.chopro",
                 "client_modified": "2024-01-01T00:00:00Z", "server_modified": "2024-01-01T00:00:00Z",
                 "rev": "1", "size": 3, "content_hash": "abc"},
                {".tag": "folder", "name": "Encores", "id": "id:e", "path_display": "/Songs/Encores"},
                {".tag": "deleted", "name": "old.chopro", "path_display": "/Songs/old.chopro"}
            ],
            "cursor": "c1",
            "has_more": false
        });
        axum::Json(body).into_response()
    }

    async fn token(State(stub): State<Arc<Stub>>) -> Response {
        stub.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        axum::Json(json!({"access_token": "fresh", "expires_in": 14400, "token_type": "bearer"})).into_response()
    }

    async fn serve(stub: Arc<Stub>) -> String {
        let app = Router::new()
            .route("/2/files/list_folder", post(list_folder))
            .route("/oauth2/token", post(token))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn store(url: &str, refresh_token: Option<&str>, refreshed: Arc<AtomicUsize>) -> DropboxStore {
        let credentials = DropboxCredentials {
            client_id: "app".to_string(),
            access_token: "stale".to_string(),
            refresh_token: refresh_token.map(str::to_string),
        };
        let client = DropboxClient::new(credentials)
            .unwrap()
            .with_endpoints(url, url)
            .on_refresh(Arc::new(move |_token: &AccessToken| {
                refreshed.fetch_add(1, Ordering::SeqCst);
            }));
        DropboxStore::new("Dropbox", client)
    }

    #[tokio::test]
    async fn test_concurrent_auth_failures_share_one_refresh() {
        let stub = Arc::new(Stub::default());
        let url = serve(stub.clone()).await;
        let refreshed = Arc::new(AtomicUsize::new(0));
        let store = store(&url, Some("refresh"), refreshed.clone());

        let (a, b, c) = tokio::join!(store.list_files("/Songs"), store.list_files("/Songs"), store.list_files("/Songs"));
        for listing in [a, b, c] {
            let listing = listing.unwrap();
            let names: Vec<_> = listing.iter().map(Entry::name).collect();
            assert_eq!(names, ["Encores", "b.chopro"]);
        }
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(refreshed.load(Ordering::SeqCst), 1);
        assert_eq!(store.client().access_token(), "fresh");
    }

    #[tokio::test]
    async fn test_without_refresh_token_auth_errors_are_final() {
        let stub = Arc::new(Stub::default());
        let url = serve(stub.clone()).await;
        let store = store(&url, None, Arc::new(AtomicUsize::new(0)));

        let err = store.list_files("/Songs").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unauthorized(_)));
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(stub.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_requires_metadata() {
        let store = store("http://127.0.0.1:9", None, Arc::new(AtomicUsize::new(0)));
        let err = store.save_text("/a.chopro".into(), SaveMode::Update, "x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
    }

    #[test]
    fn test_api_path() {
        assert_eq!(api_path("/"), "");
        assert_eq!(api_path("/Songs"), "/Songs");
    }
}
