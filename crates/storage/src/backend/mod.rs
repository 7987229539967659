//! File-store backends.
//!
//! Every backend implements [`FileStore`](crate::FileStore) and normalizes its
//! responses into the shared metadata model. Remote backends that reach over
//! the network are feature-gated so that consumers only compile the clients
//! they use:
//!
//! | Backend                  | Feature | Talks to                        |
//! |--------------------------|---------|---------------------------------|
//! | [`LocalStore`]           | always  | a directory on local disk       |
//! | [`ServerStore`]          | `http`  | a file-store server over HTTP   |
//! | [`dropbox::DropboxStore`]| `http`  | the Dropbox API v2              |
//! | [`S3Store`]              | `s3`    | any S3-compatible object store  |
//! | [`MockStore`]            | `mock`  | memory (tests only)             |

#[cfg(feature = "http")]
pub mod dropbox;
mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;
#[cfg(feature = "s3")]
mod s3;
#[cfg(feature = "http")]
mod server;

pub use self::local::LocalStore;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockStore;
#[cfg(feature = "s3")]
pub use self::s3::S3Store;
#[cfg(feature = "http")]
pub use self::server::ServerStore;
