use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use songbook_storage::error::{Error as StorageError, ErrorDisplayExt, ErrorKind};
use songbook_storage::protocol::{self, ConflictKind};

/// A failed request, rendered the way protocol clients expect.
///
/// | Kind                        | Status | Body                       |
/// |-----------------------------|--------|----------------------------|
/// | `BadRequest`, `InvalidPath` | 400    | the reason                 |
/// | `Unauthorized`              | 401    | the reason                 |
/// | `NotFound`                  | 409    | `File-Store-Error: not_found` |
/// | `Conflict`                  | 409    | `File-Store-Error: conflict`  |
/// | `Unsupported`               | 501    | what is unsupported        |
/// | anything else               | 500    | a fixed, sanitized message |
///
/// 404 is left to unmatched routes.
#[derive(Debug)]
pub struct ApiError(StorageError);

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self(exn::Exn::from(ErrorKind::BadRequest(reason.into())))
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind: &ErrorKind = &self.0;
        match kind {
            ErrorKind::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason.clone()).into_response(),
            ErrorKind::InvalidPath(_) => (StatusCode::BAD_REQUEST, self.0.to_string_lossy()).into_response(),
            ErrorKind::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason.clone()).into_response(),
            ErrorKind::NotFound(path) => conflict(ConflictKind::NotFound, format!("`{path}` does not exist")),
            ErrorKind::Conflict(reason) => conflict(ConflictKind::Conflict, reason.clone()),
            ErrorKind::Unsupported(what) => {
                (StatusCode::NOT_IMPLEMENTED, format!("{what} is not supported")).into_response()
            },
            _ => {
                tracing::error!(error = ?self.0, "Unable to handle request");
                (StatusCode::INTERNAL_SERVER_ERROR, protocol::SANITIZED_SERVER_ERROR).into_response()
            },
        }
    }
}

fn conflict(kind: ConflictKind, message: String) -> Response {
    (StatusCode::CONFLICT, [(protocol::ERROR_HEADER, kind.as_str())], message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn render(kind: ErrorKind) -> (StatusCode, Option<String>, String) {
        let response = ApiError::from(exn::Exn::from(kind)).into_response();
        let status = response.status();
        let header = response
            .headers()
            .get(protocol::ERROR_HEADER)
            .map(|value| value.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, header, String::from_utf8(body.to_vec()).unwrap())
    }

    #[rstest]
    #[case(ErrorKind::BadRequest("missing field `path`".into()), StatusCode::BAD_REQUEST, None)]
    #[case(ErrorKind::InvalidPath("/../etc".into()), StatusCode::BAD_REQUEST, None)]
    #[case(ErrorKind::NotFound("/a".into()), StatusCode::CONFLICT, Some("not_found"))]
    #[case(ErrorKind::Conflict("`/a` is not a folder".into()), StatusCode::CONFLICT, Some("conflict"))]
    #[case(ErrorKind::Unauthorized("expired".into()), StatusCode::UNAUTHORIZED, None)]
    #[case(ErrorKind::Unsupported("compressing folders"), StatusCode::NOT_IMPLEMENTED, None)]
    #[tokio::test]
    async fn test_status_mapping(#[case] kind: ErrorKind, #[case] status: StatusCode, #[case] header: Option<&str>) {
        let (actual, actual_header, _) = render(kind).await;
        assert_eq!(actual, status);
        assert_eq!(actual_header.as_deref(), header);
    }

    #[tokio::test]
    async fn test_internal_errors_are_sanitized() {
        let (status, _, body) = render(ErrorKind::Io("/srv/files/secret: permission denied".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, protocol::SANITIZED_SERVER_ERROR);
        assert!(!body.contains("secret"));
    }
}
