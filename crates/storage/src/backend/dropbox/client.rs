//! Thin Dropbox API client.
//!
//! Every operation the store needs goes through [`DropboxClient::call`], which
//! logs the call and, when Dropbox rejects the access token, refreshes it once
//! (single-flighted across concurrent callers) and retries exactly once.

use super::models::{
    CursorArg, DropboxEntry, DropboxFile, DropboxFolder, EntryResult, FolderResult, ListFolderResult, PathArg,
    RelocationArg, TokenResult, UploadArg, WriteMode, classify,
};
use crate::error::{ErrorKind, Result};
use crate::protocol::header_json;
use exn::{OptionExt, ResultExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use songbook_asyncutils::SingleFlight;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

pub const API_URL: &str = "https://api.dropboxapi.com";
pub const CONTENT_URL: &str = "https://content.dropboxapi.com";

const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";

/// A freshly issued access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: Option<u64>,
}

/// Called whenever the client obtains a new access token, so it can be
/// persisted for the next session.
pub type TokenCallback = Arc<dyn Fn(&AccessToken) + Send + Sync>;

/// OAuth credentials for a Dropbox app.
#[derive(Debug, Clone)]
pub struct DropboxCredentials {
    pub client_id: String,
    pub access_token: String,
    /// Without a refresh token, an expired access token is final.
    pub refresh_token: Option<String>,
}

pub struct DropboxClient {
    http: Client,
    api_url: String,
    content_url: String,
    client_id: String,
    refresh_token: Option<String>,
    access_token: Arc<RwLock<String>>,
    refresh: SingleFlight<std::result::Result<AccessToken, ErrorKind>>,
    on_refresh: Option<TokenCallback>,
}

impl DropboxClient {
    pub fn new(credentials: DropboxCredentials) -> Result<Self> {
        let http = Client::builder()
            .build()
            .or_raise(|| ErrorKind::Network("unable to build HTTP client".to_string()))?;
        Ok(Self {
            http,
            api_url: API_URL.to_string(),
            content_url: CONTENT_URL.to_string(),
            client_id: credentials.client_id,
            refresh_token: credentials.refresh_token,
            access_token: Arc::new(RwLock::new(credentials.access_token)),
            refresh: SingleFlight::new(),
            on_refresh: None,
        })
    }

    /// Point the client somewhere other than the real Dropbox API.
    pub fn with_endpoints(mut self, api_url: impl Into<String>, content_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self.content_url = content_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn on_refresh(mut self, callback: TokenCallback) -> Self {
        self.on_refresh = Some(callback);
        self
    }

    pub fn access_token(&self) -> String {
        self.access_token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run one API operation with logging and a single auth-refresh retry.
    async fn call<T, F, Fut>(&self, op: &'static str, path: &str, request: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        tracing::debug!(op, path, "Calling Dropbox");
        let token = self.access_token();
        match request(token.clone()).await {
            Err(err) if matches!(&*err, ErrorKind::Unauthorized(_)) && self.refresh_token.is_some() => {
                tracing::info!(op, "Dropbox rejected the access token, refreshing");
                let token = self.refresh_after(&token).await?;
                request(token).await
            },
            result => {
                if let Err(err) = &result {
                    tracing::debug!(op, path, error = ?err, "Dropbox call failed");
                }
                result
            },
        }
    }

    /// Obtain a token newer than `stale`.
    ///
    /// If another caller already replaced `stale`, its token is used as-is;
    /// otherwise one refresh runs no matter how many callers ask for it.
    async fn refresh_after(&self, stale: &str) -> Result<String> {
        let current = self.access_token();
        if current != stale {
            return Ok(current);
        }
        let Some(refresh_token) = self.refresh_token.clone() else {
            exn::bail!(ErrorKind::Unauthorized("no refresh token available".to_string()));
        };
        let http = self.http.clone();
        let url = format!("{}/oauth2/token", self.api_url);
        let client_id = self.client_id.clone();
        let shared_token = self.access_token.clone();
        let on_refresh = self.on_refresh.clone();
        let outcome = self
            .refresh
            .run(move || async move {
                let token = request_token(&http, &url, &client_id, &refresh_token).await?;
                *shared_token.write().unwrap_or_else(PoisonError::into_inner) = token.access_token.clone();
                if let Some(callback) = on_refresh {
                    callback(&token);
                }
                tracing::info!(expires_in = ?token.expires_in, "Refreshed Dropbox access token");
                Ok(token)
            })
            .await;
        outcome.map(|token| token.access_token).map_err(exn::Exn::from)
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| ErrorKind::Network(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        exn::bail!(classify(status, &body, path))
    }

    async fn rpc<A: Serialize, T: DeserializeOwned>(&self, endpoint: &str, token: &str, arg: &A, path: &str) -> Result<T> {
        let request = self.http.post(format!("{}/2/{endpoint}", self.api_url)).bearer_auth(token).json(arg);
        self.send(request, path)
            .await?
            .json()
            .await
            .or_raise(|| ErrorKind::InvalidData(format!("unexpected response from {endpoint}")))
    }

    fn content<A: Serialize>(&self, endpoint: &str, token: &str, arg: &A) -> Result<RequestBuilder> {
        Ok(self
            .http
            .post(format!("{}/2/{endpoint}", self.content_url))
            .bearer_auth(token)
            .header(API_ARG_HEADER, header_json(arg)?))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn upload(&self, path: &str, mode: WriteMode, contents: &[u8]) -> Result<DropboxFile> {
        let autorename = mode == WriteMode::Add;
        self.call("files/upload", path, |token| {
            let mode = mode.clone();
            async move {
                let arg = UploadArg { path, mode, autorename, mute: false };
                let request = self
                    .content("files/upload", &token, &arg)?
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(contents.to_vec());
                self.send(request, path)
                    .await?
                    .json()
                    .await
                    .or_raise(|| ErrorKind::InvalidData("unexpected response from files/upload".to_string()))
            }
        })
        .await
    }

    pub async fn download(&self, path: &str) -> Result<(DropboxFile, Vec<u8>)> {
        self.call("files/download", path, |token| async move {
            let request = self.content("files/download", &token, &PathArg { path })?;
            let response = self.send(request, path).await?;
            let file: DropboxFile = response
                .headers()
                .get(API_RESULT_HEADER)
                .and_then(|value| value.to_str().ok())
                .ok_or_raise(|| ErrorKind::InvalidData(format!("missing `{API_RESULT_HEADER}` header")))
                .and_then(|raw| {
                    serde_json::from_str(raw)
                        .or_raise(|| ErrorKind::InvalidData(format!("invalid `{API_RESULT_HEADER}` header")))
                })?;
            let bytes = response.bytes().await.map_err(|e| ErrorKind::Network(e.to_string()))?;
            Ok((file, bytes.to_vec()))
        })
        .await
    }

    /// All entries of a folder, following `has_more` cursors.
    pub async fn list_folder(&self, path: &str) -> Result<Vec<DropboxEntry>> {
        let mut page: ListFolderResult = self
            .call("files/list_folder", path, |token| async move {
                self.rpc("files/list_folder", &token, &PathArg { path }, path).await
            })
            .await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            let cursor = page.cursor.clone();
            page = self
                .call("files/list_folder/continue", path, |token| {
                    let cursor = cursor.clone();
                    async move { self.rpc("files/list_folder/continue", &token, &CursorArg { cursor: &cursor }, path).await }
                })
                .await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }

    pub async fn move_v2(&self, from: &str, to: &str) -> Result<DropboxEntry> {
        let result: EntryResult = self
            .call("files/move_v2", from, |token| async move {
                let arg = RelocationArg { from_path: from, to_path: to, autorename: false };
                self.rpc("files/move_v2", &token, &arg, from).await
            })
            .await?;
        Ok(result.metadata)
    }

    pub async fn create_folder_v2(&self, path: &str) -> Result<DropboxFolder> {
        let result: FolderResult = self
            .call("files/create_folder_v2", path, |token| async move {
                self.rpc("files/create_folder_v2", &token, &PathArg { path }, path).await
            })
            .await?;
        Ok(result.metadata)
    }

    pub async fn download_zip(&self, path: &str) -> Result<Vec<u8>> {
        self.call("files/download_zip", path, |token| async move {
            let request = self.content("files/download_zip", &token, &PathArg { path })?;
            let response = self.send(request, path).await?;
            Ok(response.bytes().await.map_err(|e| ErrorKind::Network(e.to_string()))?.to_vec())
        })
        .await
    }

    pub async fn delete_v2(&self, path: &str) -> Result<DropboxEntry> {
        let result: EntryResult = self
            .call("files/delete_v2", path, |token| async move {
                self.rpc("files/delete_v2", &token, &PathArg { path }, path).await
            })
            .await?;
        Ok(result.metadata)
    }
}

async fn request_token(
    http: &Client,
    url: &str,
    client_id: &str,
    refresh_token: &str,
) -> std::result::Result<AccessToken, ErrorKind> {
    let response = http
        .post(url)
        .form(&[("grant_type", "refresh_token"), ("client_id", client_id), ("refresh_token", refresh_token)])
        .send()
        .await
        .map_err(|e| ErrorKind::Network(e.to_string()))?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        // A refresh token Dropbox refuses is as final as a bad access token.
        return Err(match status {
            400 | 401 => ErrorKind::Unauthorized(format!("token refresh rejected: {}", body.trim())),
            status => ErrorKind::Server { status, message: body },
        });
    }
    let token: TokenResult =
        response.json().await.map_err(|e| ErrorKind::InvalidData(format!("token refresh response: {e}")))?;
    Ok(AccessToken { access_token: token.access_token, expires_in: token.expires_in })
}
