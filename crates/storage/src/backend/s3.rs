//! S3-compatible file store.
//!
//! This module provides a file store for S3-compatible services including
//! AWS S3, Backblaze B2, Tigris (Fly.io), MinIO and others.
//!
//! S3 has no folders: a folder is a `/`-delimited key prefix, plus a zero-byte
//! `folder/` marker object so that empty folders survive. The object ETag is
//! used for both `rev` and `hash`; it is not a SHA-256, but it is consistent
//! for identical uploads, which is all cache comparison needs.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file.

use crate::error::{ErrorKind, Result};
use crate::mirror::WriteThrough;
use crate::models::{BlobFile, Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, sort_entries};
use crate::path::{self, canonicalize};
use crate::store::{CacheHandle, FileStore};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::ResultExt;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible file store.
///
/// Stores files in an S3 bucket, optionally under a key prefix. Store paths
/// map to keys by dropping the leading `/`.
///
/// # Examples
///
/// ```no_run
/// use songbook_storage::backend::S3Store;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = S3Store::new(
///     "my-storage",
///     "my-bucket",
///     Some("songs/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct S3Store {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
    writes: WriteThrough,
}

impl S3Store {
    /// Create a new S3 file store.
    ///
    /// # Arguments
    /// * `name` - A name for this store (used in display/logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(|prefix| canonicalize(&prefix))
            .transpose()?
            .filter(|prefix| !path::is_root(prefix))
            .map(|prefix| prefix.trim_start_matches('/').to_string());
        let credentials = Credentials::new(key_id, key_secret, None, None, "songbook-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
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

    /// Object key for a canonical file path.
    fn key(&self, path: &str) -> String {
        object_key(self.prefix.as_deref(), path)
    }

    /// Key prefix (with trailing `/`) of everything inside a canonical folder.
    fn folder_prefix(&self, path: &str) -> String {
        folder_prefix(self.prefix.as_deref(), path)
    }

    /// Canonical path for an object key, or `None` if it lies outside the prefix.
    fn path_for_key(&self, key: &str) -> Option<String> {
        let relative = match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str())?.strip_prefix('/')?,
            None => key,
        };
        canonicalize(relative).ok()
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::Io("S3 rate limiter closed".to_string()))
    }

    /// Metadata of a single object, `None` if it does not exist.
    async fn head(&self, path: &str) -> Result<Option<FileMetadata>> {
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(self.key(path)).send().await {
            Ok(output) => Ok(Some(file_metadata(
                path,
                output.e_tag(),
                output.last_modified(),
                output.content_length(),
            )?)),
            Err(err) => match classify(&err, path) {
                ErrorKind::NotFound(_) => Ok(None),
                kind => Err(exn::Exn::from(kind)),
            },
        }
    }

    /// Every key under a folder (recursive), including its marker.
    async fn keys_under(&self, path: &str) -> Result<Vec<String>> {
        let prefix = self.folder_prefix(path);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let _permit = self.acquire_permit().await?;
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| classify(&err, path))?;
            keys.extend(output.contents().iter().filter_map(|object| object.key().map(str::to_string)));
            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn get(&self, path: &str) -> Result<BlobFile> {
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|err| classify(&err, path))?;
        let metadata = file_metadata(path, output.e_tag(), output.last_modified(), output.content_length())?;
        let blob = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("interrupted while downloading `{path}`")))?
            .into_bytes()
            .to_vec();
        Ok(BlobFile { metadata, blob })
    }

    async fn put(&self, path: &str, contents: Vec<u8>) -> Result<FileMetadata> {
        let size = contents.len() as i64;
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(contents))
            .send()
            .await
            .map_err(|err| classify(&err, path))?;
        file_metadata(path, output.e_tag(), None, Some(size))
    }

    async fn copy(&self, from_key: &str, to_key: &str, path: &str) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(encode_copy_source(&self.bucket, from_key))
            .key(to_key)
            .send()
            .await
            .map_err(|err| classify(&err, path))?;
        Ok(())
    }

    async fn delete_key(&self, key: &str, path: &str) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify(&err, path))?;
        Ok(())
    }
}

fn object_key(prefix: Option<&str>, path: &str) -> String {
    let relative = path.trim_start_matches('/');
    match prefix {
        Some(prefix) => format!("{}/{relative}", prefix.trim_end_matches('/')),
        None => relative.to_string(),
    }
}

fn folder_prefix(prefix: Option<&str>, path: &str) -> String {
    if path::is_root(path) {
        return prefix.map(|prefix| format!("{}/", prefix.trim_end_matches('/'))).unwrap_or_default();
    }
    format!("{}/", object_key(prefix, path))
}

/// `bucket/key` with the key percent-encoded, as `CopySource` requires.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => encoded.push(byte as char),
            byte => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Convert AWS DateTime to OffsetDateTime.
fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
        .or_raise(|| ErrorKind::InvalidData("S3 datetime out of range".to_string()))
}

/// Whether an `add` of `contents` would only duplicate the object described
/// by `existing`, whose bytes are `stored` when they were downloaded.
fn already_stored(existing: &FileMetadata, stored: Option<&[u8]>, contents: &[u8]) -> bool {
    existing.size == contents.len() as u64 && stored.is_some_and(|stored| stored == contents)
}

fn file_metadata(path: &str, e_tag: Option<&str>, modified: Option<&DateTime>, size: Option<i64>) -> Result<FileMetadata> {
    let modified = match modified {
        Some(modified) => parse_datetime(modified)?,
        None => OffsetDateTime::now_utc(),
    };
    let e_tag = e_tag.unwrap_or_default().trim_matches('"').to_string();
    Ok(FileMetadata {
        name: path::basename(path).to_string(),
        path: path.to_string(),
        id: path.to_string(),
        client_modified: modified,
        server_modified: modified,
        rev: e_tag.clone(),
        size: size.unwrap_or_default().max(0) as u64,
        is_downloadable: true,
        hash: e_tag,
    })
}

fn classify<E>(err: &SdkError<E, HttpResponse>, path: &str) -> ErrorKind
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ErrorKind::Network(message),
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            match (status, context.err().code()) {
                (404, _) | (_, Some("NoSuchKey" | "NotFound")) => ErrorKind::NotFound(path.to_string()),
                (401 | 403, _) => ErrorKind::Unauthorized(message),
                (400, _) => ErrorKind::BadRequest(message),
                (409 | 412, _) => ErrorKind::Conflict(message),
                (status, _) => ErrorKind::Server { status, message },
            }
        },
        _ => ErrorKind::Server { status: 500, message },
    }
}

#[async_trait]
impl FileStore for S3Store {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_blob(&self, target: SaveTarget, mode: SaveMode, contents: Vec<u8>) -> Result<FileMetadata> {
        let requested = canonicalize(target.path())?;
        if path::is_root(&requested) {
            exn::bail!(ErrorKind::BadRequest("cannot save a file at the root".to_string()));
        }
        let existing = self.head(&requested).await?;
        let path = match (mode, existing) {
            (SaveMode::Add, Some(existing)) => {
                // Only an object of the same size is worth downloading.
                let stored = if existing.size == contents.len() as u64 {
                    Some(self.get(&requested).await?.blob)
                } else {
                    None
                };
                if already_stored(&existing, stored.as_deref(), &contents) {
                    return Ok(existing);
                }
                let mut n = 1;
                while self.head(&path::autorename(&requested, n)).await?.is_some() {
                    n += 1;
                }
                path::autorename(&requested, n)
            },
            (SaveMode::Update, Some(existing)) => {
                if let Some(expected) = target.metadata()
                    && expected.rev != existing.rev
                {
                    exn::bail!(ErrorKind::Conflict(format!("`{requested}` has changed since it was loaded")));
                }
                requested
            },
            _ => requested,
        };
        let metadata = self.put(&path, contents.clone()).await?;

        let mirrored = metadata.clone();
        self.writes.mirror("save_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.into(), SaveMode::Overwrite, contents).await
        });
        Ok(metadata)
    }

    async fn load_blob(&self, path: &str) -> Result<BlobFile> {
        let path = canonicalize(path)?;
        let file = self.get(&path).await?;

        let mirrored = file.clone();
        self.writes.mirror("load_blob", &path, move |cache| async move {
            cache.save_blob(mirrored.metadata.into(), SaveMode::Overwrite, mirrored.blob).await
        });
        Ok(file)
    }

    async fn list_files(&self, path: &str) -> Result<Vec<Entry>> {
        let path = canonicalize(path)?;
        let prefix = self.folder_prefix(&path);
        let mut entries = Vec::new();
        let mut saw_marker = false;
        let mut continuation: Option<String> = None;
        loop {
            let _permit = self.acquire_permit().await?;
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| classify(&err, &path))?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                if key == prefix {
                    saw_marker = true;
                    continue;
                }
                let Some(child) = self.path_for_key(key) else { continue };
                entries.push(Entry::File(file_metadata(&child, object.e_tag(), object.last_modified(), object.size())?));
            }
            for common in output.common_prefixes() {
                let Some(child) = common.prefix().and_then(|key| self.path_for_key(key)) else { continue };
                entries.push(Entry::Folder(FolderMetadata {
                    name: path::basename(&child).to_string(),
                    id: child.clone(),
                    path: child,
                }));
            }
            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        if entries.is_empty() && !saw_marker && !path::is_root(&path) {
            exn::bail!(ErrorKind::NotFound(path));
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
        if path::is_root(&from) || path::is_within(&to, &from) {
            exn::bail!(ErrorKind::BadRequest(format!("cannot move `{from}` to `{to}`")));
        }
        if self.head(&to).await?.is_some() || !self.keys_under(&to).await?.is_empty() {
            exn::bail!(ErrorKind::Conflict(format!("`{to}` already exists")));
        }
        let entry = if self.head(&from).await?.is_some() {
            self.copy(&self.key(&from), &self.key(&to), &from).await?;
            self.delete_key(&self.key(&from), &from).await?;
            match self.head(&to).await? {
                Some(metadata) => Entry::File(metadata),
                None => exn::bail!(ErrorKind::NotFound(to)),
            }
        } else {
            let keys = self.keys_under(&from).await?;
            if keys.is_empty() {
                exn::bail!(ErrorKind::NotFound(from));
            }
            let (old_prefix, new_prefix) = (self.folder_prefix(&from), self.folder_prefix(&to));
            for key in &keys {
                let Some(rest) = key.strip_prefix(&old_prefix) else { continue };
                self.copy(key, &format!("{new_prefix}{rest}"), &from).await?;
            }
            for key in &keys {
                self.delete_key(key, &from).await?;
            }
            Entry::Folder(FolderMetadata { name: path::basename(&to).to_string(), id: to.clone(), path: to.clone() })
        };

        let (source, destination) = (from.clone(), to);
        self.writes.mirror("move_entry", &from, move |cache| async move {
            cache.move_entry(&source, &destination).await
        });
        Ok(entry)
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata> {
        let path = canonicalize(path)?;
        if self.head(&path).await?.is_some() {
            exn::bail!(ErrorKind::Conflict(format!("`{path}` is a file")));
        }
        if !path::is_root(&path) {
            let _permit = self.acquire_permit().await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(self.folder_prefix(&path))
                .body(ByteStream::from(Vec::new()))
                .send()
                .await
                .map_err(|err| classify(&err, &path))?;
        }
        let folder = FolderMetadata { name: path::basename(&path).to_string(), id: path.clone(), path: path.clone() };

        let created = path.clone();
        self.writes.mirror("create_folder", &path, move |cache| async move {
            cache.create_folder(&created).await
        });
        Ok(folder)
    }

    async fn compress_folder(&self, _path: &str) -> Result<Vec<u8>> {
        exn::bail!(ErrorKind::Unsupported("compressing folders"))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = canonicalize(path)?;
        if path::is_root(&path) {
            exn::bail!(ErrorKind::BadRequest("cannot delete the root".to_string()));
        }
        if self.head(&path).await?.is_some() {
            self.delete_key(&self.key(&path), &path).await?;
        } else {
            let keys = self.keys_under(&path).await?;
            if keys.is_empty() {
                exn::bail!(ErrorKind::NotFound(path));
            }
            for key in &keys {
                self.delete_key(key, &path).await?;
            }
        }

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
    use rstest::rstest;

    #[rstest]
    #[case(None, "/Songs/a.chopro", "Songs/a.chopro")]
    #[case(Some("library"), "/Songs/a.chopro", "library/Songs/a.chopro")]
    #[case(Some("library/"), "/a", "library/a")]
    fn test_object_key(#[case] prefix: Option<&str>, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(object_key(prefix, path), expected);
    }

    #[rstest]
    #[case(None, "/", "")]
    #[case(Some("library"), "/", "library/")]
    #[case(None, "/Songs", "Songs/")]
    #[case(Some("library"), "/Songs", "library/Songs/")]
    fn test_folder_prefix(#[case] prefix: Option<&str>, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(folder_prefix(prefix, path), expected);
    }

    #[test]
    fn test_encode_copy_source() {
        assert_eq!(encode_copy_source("bucket", "Songs/a (1).chopro"), "bucket/Songs/a%20%281%29.chopro");
        assert_eq!(encode_copy_source("bucket", "Canción"), "bucket/Canci%C3%B3n");
    }

    #[test]
    fn test_file_metadata_uses_etag() {
        let metadata = file_metadata("/Songs/a.chopro", Some("\"9b2cf535f27731c974343645a3985328\""), None, Some(5)).unwrap();
        assert_eq!(metadata.rev, "9b2cf535f27731c974343645a3985328");
        assert_eq!(metadata.hash, metadata.rev);
        assert_eq!(metadata.name, "a.chopro");
        assert_eq!(metadata.size, 5);
    }

    #[rstest]
    #[case::identical(Some(&b"{title: Jolene}"[..]), b"{title: Jolene}", true)]
    #[case::same_size_other_bytes(Some(&b"{title: Jolene}"[..]), b"{title: Joleen}", false)]
    #[case::not_downloaded(None, b"{title: Jolene}", false)]
    #[case::other_size(Some(&b"{title: Jolene}"[..]), b"{title: Jolene (live)}", false)]
    fn test_already_stored(#[case] stored: Option<&[u8]>, #[case] contents: &[u8], #[case] expected: bool) {
        let existing = file_metadata("/Country/jolene.chopro", Some("\"etag\""), None, Some(15)).unwrap();
        assert_eq!(already_stored(&existing, stored, contents), expected);
    }

    #[test]
    fn test_parse_datetime() {
        let dt = DateTime::from_secs(1_704_067_200);
        assert_eq!(parse_datetime(&dt).unwrap().unix_timestamp(), 1_704_067_200);
    }
}
