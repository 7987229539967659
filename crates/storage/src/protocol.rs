//! Wire format of the file-store HTTP protocol.
//!
//! Shared by the server (which decodes requests) and the HTTP client backend
//! (which encodes them), so both ends agree on field names and headers.

use crate::error::{Error, ErrorKind};
use crate::models::SaveMode;
use serde::{Deserialize, Serialize};

/// Request metadata for `save-blob` and `load-blob`, JSON-encoded.
pub const REQUEST_HEADER: &str = "File-Store-Request";
/// Response metadata for `load-blob`, JSON-encoded.
pub const RESPONSE_HEADER: &str = "File-Store-Response";
/// Distinguishes the two kinds of 409 response.
pub const ERROR_HEADER: &str = "File-Store-Error";

pub const LIST_FILES: &str = "/list-files";
pub const SAVE_BLOB: &str = "/save-blob";
pub const LOAD_BLOB: &str = "/load-blob";
pub const MOVE: &str = "/move";
pub const CREATE_FOLDER: &str = "/create-folder";
pub const DELETE: &str = "/delete";
pub const COMPRESS_FOLDER: &str = "/compress-folder";

pub const ROUTES: [&str; 7] = [LIST_FILES, SAVE_BLOB, LOAD_BLOB, MOVE, CREATE_FOLDER, DELETE, COMPRESS_FOLDER];

/// Sent to end users instead of anything that went wrong inside the server.
pub const SANITIZED_SERVER_ERROR: &str = "Uh oh, looks like the server couldn’t figure out your request.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveBlobRequest {
    pub path: String,
    #[serde(default)]
    pub mode: SaveMode,
    /// Revision the client last saw; only checked in `update` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub from_path: String,
    pub to_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderRequest {
    pub folder_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub target_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    NotFound,
    Conflict,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_found" => Some(Self::NotFound),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// Serialize to JSON that is safe to put in an HTTP header value.
///
/// Header values must be visible ASCII, so anything outside that range is
/// written as a `\uXXXX` escape (surrogate pairs above the BMP). The result
/// is still valid JSON and decodes to the same value.
pub fn header_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_string(value)
        .map_err(|err| ErrorKind::InvalidData(format!("unable to encode header: {err}")))?;
    let mut escaped = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && !ch.is_ascii_control() {
            escaped.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    Ok(escaped)
}

/// Decode header JSON; every value must be a string.
pub fn parse_header_json<T: for<'de> Deserialize<'de>>(header: &str, raw: &str) -> Result<T, Error> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|_| ErrorKind::BadRequest(format!("`{header}` header is not valid JSON")))?;
    let Some(object) = value.as_object() else {
        exn::bail!(ErrorKind::BadRequest(format!("`{header}` header must be a JSON object")));
    };
    if let Some((key, _)) = object.iter().find(|(_, value)| !value.is_string()) {
        exn::bail!(ErrorKind::BadRequest(format!("`{header}` header value `{key}` must be a string")));
    }
    serde_json::from_value(value).map_err(|err| exn::Exn::from(ErrorKind::BadRequest(format!("`{header}` header: {err}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_json_escapes_non_ascii() {
        let request = PathRequest { path: "/Canción/☃ 🎸.chopro".to_string() };
        let encoded = header_json(&request).unwrap();
        assert!(encoded.is_ascii());
        assert!(encoded.contains("\\u00f3"));
        assert!(encoded.contains("\\ud83c\\udfb8"));
        let decoded: PathRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_parse_header_json_requires_strings() {
        let parsed: SaveBlobRequest = parse_header_json(REQUEST_HEADER, r#"{"path":"/a","mode":"add"}"#).unwrap();
        assert_eq!(parsed.mode, SaveMode::Add);
        let parsed: SaveBlobRequest = parse_header_json(REQUEST_HEADER, r#"{"path":"/a"}"#).unwrap();
        assert_eq!(parsed.mode, SaveMode::Overwrite);

        let err = parse_header_json::<SaveBlobRequest>(REQUEST_HEADER, r#"{"path":1}"#).unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
        let err = parse_header_json::<SaveBlobRequest>(REQUEST_HEADER, "not json").unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
        let err = parse_header_json::<SaveBlobRequest>(REQUEST_HEADER, "{}").unwrap_err();
        assert!(matches!(&*err, ErrorKind::BadRequest(_)));
    }

    #[test]
    fn test_move_request_field_names() {
        let request: MoveRequest = serde_json::from_str(r#"{"fromPath":"/a","toPath":"/b"}"#).unwrap();
        assert_eq!(request.from_path, "/a");
        assert_eq!(request.to_path, "/b");
    }
}
