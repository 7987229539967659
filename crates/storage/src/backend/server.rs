//! Client for the file-store HTTP protocol.
//!
//! Talks to a `songbook-server` (or anything speaking the same protocol),
//! normally mounted under `/fs-server`. See [`crate::protocol`] for the wire
//! format.

use crate::error::{ErrorKind, Result};
use crate::models::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, sort_entries};
use crate::path::canonicalize;
use crate::protocol::{
    self, ConflictKind, CreateFolderRequest, DeleteRequest, MoveRequest, PathRequest, SaveBlobRequest, header_json,
};
use crate::store::{CacheHandle, FileStore};
use crate::mirror::WriteThrough;
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// File store backed by a remote file-store server.
///
/// # Examples
///
/// ```no_run
/// use songbook_storage::backend::ServerStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ServerStore::new("server", "http://localhost:6543/fs-server")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerStore {
    name: String,
    base_url: String,
    client: Client,
    writes: WriteThrough,
}

impl ServerStore {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .or_raise(|| ErrorKind::Network("unable to build HTTP client".to_string()))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            writes: WriteThrough::default(),
        })
    }

    pub fn with_cache(mut self, cache: CacheHandle) -> Self {
        self.writes = WriteThrough::new(Some(cache));
        self
    }

    pub fn write_through(&self) -> &WriteThrough {
        &self.writes
    }

    fn post(&self, endpoint: &str) -> RequestBuilder {
        self.client.post(format!("{}{endpoint}", self.base_url))
    }

    /// Send a request, turning non-2xx responses into errors.
    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| send_error(&e))?;
        if response.status().is_success() {
            return Ok(response);
        }
        exn::bail!(error_from_response(response, path).await)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, endpoint: &str, body: &B, path: &str) -> Result<T> {
        let response = self.send(self.post(endpoint).json(body), path).await?;
        response
            .json()
            .await
            .or_raise(|| ErrorKind::InvalidData(format!("unexpected response from {endpoint}")))
    }
}

fn send_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_decode() {
        ErrorKind::InvalidData(err.to_string())
    } else {
        ErrorKind::Network(err.to_string())
    }
}

async fn error_from_response(response: Response, path: &str) -> ErrorKind {
    let status = response.status().as_u16();
    let conflict = response
        .headers()
        .get(protocol::ERROR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(ConflictKind::parse);
    let message = response.text().await.unwrap_or_default();
    match (status, conflict) {
        (400, _) => ErrorKind::BadRequest(message),
        (401 | 403, _) => ErrorKind::Unauthorized(message),
        (409, Some(ConflictKind::NotFound)) => ErrorKind::NotFound(path.to_string()),
        (409, _) => ErrorKind::Conflict(message),
        (501, _) => ErrorKind::Unsupported("this operation"),
        (status, _) => ErrorKind::Server { status, message },
    }
}

#[async_trait]
impl FileStore for ServerStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let path = canonicalize(target.path())?;
        let rev = target.metadata().filter(|_| mode == SaveMode::Update).map(|metadata| metadata.rev.clone());
        let header = header_json(&SaveBlobRequest { path: path.clone(), mode, rev })?;
        let request = self
            .post(protocol::SAVE_BLOB)
            .header(protocol::REQUEST_HEADER, header)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(contents.clone());
        let metadata: FileMetadata = self
            .send(request, &path)
            .await?
            .json()
            .await
            .or_raise(|| ErrorKind::InvalidData("unexpected response from save-blob".to_string()))?;

        let mirrored = metadata.clone();
        self.writes.mirror("save_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.into(), SaveMode::Overwrite, contents).await
        });
        Ok(metadata)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        let path = canonicalize(path)?;
        let header = header_json(&PathRequest { path: path.clone() })?;
        let request = self.post(protocol::LOAD_BLOB).header(protocol::REQUEST_HEADER, header);
        let response = self.send(request, &path).await?;
        let metadata = response
            .headers()
            .get(protocol::RESPONSE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_raise(|| ErrorKind::InvalidData(format!("missing `{}` header", protocol::RESPONSE_HEADER)))?;
        let metadata: FileMetadata = serde_json::from_str(metadata)
            .or_raise(|| ErrorKind::InvalidData(format!("invalid `{}` header", protocol::RESPONSE_HEADER)))?;
        let blob = response.bytes().await.map_err(|e| send_error(&e))?.to_vec();
        let file = BlobFile { metadata, blob };

        let mirrored = file.clone();
        self.writes.mirror("load_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.metadata.into(), SaveMode::Overwrite, mirrored.blob).await
        });
        Ok(file)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        let path = canonicalize(path)?;
        let mut entries: Vec<Entry> =
            self.post_json(protocol::LIST_FILES, &PathRequest { path: path.clone() }, &path).await?;
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
        let request = MoveRequest { from_path: from.clone(), to_path: to.clone() };
        let entry: Entry = self.post_json(protocol::MOVE, &request, &from).await?;

        let (source, destination) = (from.clone(), to);
        self.writes.mirror("move_entry", &from, move |cache| async move {
            cache.move_entry(&source, &destination).await
        });
        Ok(entry)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let path = canonicalize(path)?;
        let request = CreateFolderRequest { folder_path: path.clone() };
        let folder: FolderMetadata = self.post_json(protocol::CREATE_FOLDER, &request, &path).await?;

        let created = path.clone();
        self.writes.mirror("create_folder", &path, move |cache| async move {
            cache.create_folder(&created).await
        });
        Ok(folder)
    }

    async fn compress_folder(&self, path: &str) -> Result<Vec<u8>> {
        let path = canonicalize(path)?;
        let request = self.post(protocol::COMPRESS_FOLDER).json(&PathRequest { path: path.clone() });
        let response = self.send(request, &path).await?;
        Ok(response.bytes().await.map_err(|e| send_error(&e))?.to_vec())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = canonicalize(path)?;
        let request = self.post(protocol::DELETE).json(&DeleteRequest { target_path: path.clone() });
        self.send(request, &path).await?;

        let deleted = path.clone();
        self.writes.mirror("delete", &path, move |cache| async move { cache.delete(&deleted).await });
        Ok(())
    }

    fn cache(&self) -> Option<&CacheHandle> {
        self.writes.cache()
    }
}
