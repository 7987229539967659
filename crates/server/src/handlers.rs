use crate::response::ApiError;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use songbook_storage::error::ErrorKind;
use songbook_storage::path::{self, canonicalize};
use songbook_storage::protocol::{
    self, CreateFolderRequest, DeleteRequest, MoveRequest, PathRequest, SaveBlobRequest, header_json, parse_header_json,
};
use songbook_storage::{Entry, FileMetadata, FolderMetadata, SaveMode, SaveTarget, StoreHandle};

const IGNORED_NAMES: [&str; 1] = [".DS_Store"];

type ApiResult<T> = Result<T, ApiError>;

/// Decode a JSON request body. Serde names the missing or mistyped field.
fn body<T: DeserializeOwned>(bytes: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(bytes).map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}

/// Decode the JSON request header.
fn request_header<T: DeserializeOwned>(headers: &HeaderMap) -> ApiResult<T> {
    let raw = headers
        .get(protocol::REQUEST_HEADER)
        .ok_or_else(|| ApiError::bad_request(format!("missing `{}` header", protocol::REQUEST_HEADER)))?
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("`{}` header is not ASCII", protocol::REQUEST_HEADER)))?;
    Ok(parse_header_json(protocol::REQUEST_HEADER, raw)?)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    // Header JSON is ASCII-only, so this only fails on a bug.
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::from(exn::Exn::from(ErrorKind::InvalidData("unencodable response header".to_string()))))
}

pub(crate) async fn routes() -> Json<[&'static str; 7]> {
    Json(protocol::ROUTES)
}

pub(crate) async fn list_files(State(store): State<StoreHandle>, bytes: Bytes) -> ApiResult<Json<Vec<Entry>>> {
    let PathRequest { path } = body(&bytes)?;
    let mut entries = store.list_files(&path).await?;
    entries.retain(|entry| !IGNORED_NAMES.contains(&entry.name()));
    Ok(Json(entries))
}

pub(crate) async fn save_blob(
    State(store): State<StoreHandle>,
    headers: HeaderMap,
    bytes: Bytes,
) -> ApiResult<Json<FileMetadata>> {
    let SaveBlobRequest { path, mode, rev } = request_header(&headers)?;
    if path::is_root(&canonicalize(&path)?) {
        return Err(ApiError::bad_request("cannot save to the mount root"));
    }
    tracing::debug!(path = %path, mode = mode.as_str(), size = bytes.len(), "Saving blob");
    let target = match rev {
        Some(rev) if mode == SaveMode::Update => match store.load_blob(&path).await {
            Ok(current) if current.metadata.rev != rev => {
                return Err(ApiError::from(exn::Exn::from(ErrorKind::Conflict(format!(
                    "`{path}` has changed since it was loaded"
                )))));
            },
            Ok(current) => SaveTarget::Metadata(current.metadata),
            Err(err) if err.is_not_found() => SaveTarget::Path(path),
            Err(err) => return Err(err.into()),
        },
        _ => SaveTarget::Path(path),
    };
    Ok(Json(store.save_blob(target, mode, bytes.to_vec()).await?))
}

pub(crate) async fn load_blob(State(store): State<StoreHandle>, headers: HeaderMap) -> ApiResult<Response> {
    let PathRequest { path } = request_header(&headers)?;
    let file = store.load_blob(&path).await?;
    let metadata = header_value(&header_json(&file.metadata)?)?;
    Ok((
        [(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        [(protocol::RESPONSE_HEADER, metadata)],
        file.blob,
    )
        .into_response())
}

pub(crate) async fn move_entry(State(store): State<StoreHandle>, bytes: Bytes) -> ApiResult<Json<Entry>> {
    let MoveRequest { from_path, to_path } = body(&bytes)?;
    Ok(Json(store.move_entry(&from_path, &to_path).await?))
}

pub(crate) async fn create_folder(State(store): State<StoreHandle>, bytes: Bytes) -> ApiResult<Json<FolderMetadata>> {
    let CreateFolderRequest { folder_path } = body(&bytes)?;
    Ok(Json(store.create_folder(&folder_path).await?))
}

pub(crate) async fn delete(State(store): State<StoreHandle>, bytes: Bytes) -> ApiResult<()> {
    let DeleteRequest { target_path } = body(&bytes)?;
    store.delete(&target_path).await?;
    Ok(())
}

pub(crate) async fn compress_folder(State(store): State<StoreHandle>, bytes: Bytes) -> ApiResult<Response> {
    let PathRequest { path } = body(&bytes)?;
    let path = canonicalize(&path)?;
    let archive = store.compress_folder(&path).await?;
    let disposition = header_value(&format!("attachment; filename=\"{}.zip\"", archive_name(&path)))?;
    Ok((
        [(CONTENT_TYPE, HeaderValue::from_static("application/zip")), (CONTENT_DISPOSITION, disposition)],
        archive,
    )
        .into_response())
}

/// Download name for a folder archive, restricted to what a quoted header
/// parameter can carry.
fn archive_name(path: &str) -> String {
    let name = match path::basename(path) {
        "" => "files",
        name => name,
    };
    name.chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ' ' => ch,
            ch if ch.is_ascii_graphic() => ch,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/", "files")]
    #[case("/Songs", "Songs")]
    #[case("/Set \"1\"", "Set _1_")]
    #[case("/Canción", "Canci_n")]
    fn test_archive_name(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(archive_name(path), expected);
    }

    #[test]
    fn test_body_names_missing_field() {
        let err = body::<MoveRequest>(&Bytes::from_static(br#"{"fromPath":"/a"}"#)).unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
