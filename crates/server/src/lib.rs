//! HTTP server for the file-store protocol.
//!
//! Serves any [`FileStore`](songbook_storage::FileStore) (normally a
//! [`LocalStore`](songbook_storage::backend::LocalStore) over a mount
//! directory) with the routes in [`songbook_storage::protocol`]. Every path
//! is canonicalized before it reaches the store, so nothing outside the
//! mount can be addressed.
//!
//! # Examples
//!
//! ```no_run
//! use songbook_storage::backend::LocalStore;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalStore::new("local", "/srv/songs").unwrap());
//! let app = songbook_server::router(store, "/fs-server");
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:6543").await?;
//! songbook_server::serve(listener, app, std::future::pending()).await.unwrap();
//! # Ok(())
//! # }
//! ```

pub mod error;
mod handlers;
mod response;

pub use crate::response::ApiError;
use crate::error::{ErrorKind, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use exn::ResultExt;
use songbook_storage::StoreHandle;
use songbook_storage::protocol;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Uploads are whole files held in memory.
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// The protocol routes over `store`, nested under `prefix` (`""` or `"/"`
/// for none).
pub fn router(store: StoreHandle, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/", get(handlers::routes))
        .route(protocol::LIST_FILES, post(handlers::list_files))
        .route(protocol::SAVE_BLOB, post(handlers::save_blob))
        .route(protocol::LOAD_BLOB, post(handlers::load_blob))
        .route(protocol::MOVE, post(handlers::move_entry))
        .route(protocol::CREATE_FOLDER, post(handlers::create_folder))
        .route(protocol::DELETE, post(handlers::delete))
        .route(protocol::COMPRESS_FOLDER, post(handlers::compress_folder))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(store);
    let prefix = prefix.trim_end_matches('/');
    let app = if prefix.is_empty() { routes } else { Router::new().nest(prefix, routes) };
    app.layer(TraceLayer::new_for_http())
}

/// Serve `app` until `shutdown` resolves.
pub async fn serve(listener: TcpListener, app: Router, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let address = listener.local_addr().or_raise(|| ErrorKind::Bind("unknown address".to_string()))?;
    tracing::info!(%address, "Serving the file-store protocol");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.or_raise(|| ErrorKind::Serve)
}
