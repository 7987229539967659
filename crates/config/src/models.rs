use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use songbook_cache::HashMatchPolicy;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub backend: BackendConfig,
}

/// The file-store protocol server (`songbook serve`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory served; nothing outside it is reachable.
    pub mount: PathBuf,
    /// Route prefix, `""` to serve at the root.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite database file.
    pub path: PathBuf,
    pub enabled: bool,
    pub on_hash_match: HashMatchPolicy,
}

/// Where files live, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    /// A remote `songbook serve` (or compatible) instance.
    Server {
        url: String,
    },
    Dropbox {
        client_id: String,
        access_token: String,
        refresh_token: Option<String>,
    },
    S3 {
        bucket: String,
        prefix: Option<String>,
        region: String,
        /// For S3-compatible services other than AWS.
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

impl Config {
    /// Built-in defaults. Without platform directories (no home directory)
    /// everything lives under `songbook` in the working directory.
    pub fn defaults(dirs: Option<&ProjectDirs>) -> Self {
        let fallback = std::env::current_dir().unwrap_or_default().join("songbook");
        let data_dir = dirs.map_or_else(|| fallback.clone(), |dirs| dirs.data_dir().to_path_buf());
        let cache_dir = dirs.map_or(fallback, |dirs| dirs.cache_dir().to_path_buf());
        let mount = data_dir.join("files");
        Self {
            server: ServerConfig {
                bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 6543)),
                mount: mount.clone(),
                prefix: "/fs-server".to_string(),
            },
            cache: CacheConfig {
                path: cache_dir.join("offline-cache.sqlite"),
                enabled: true,
                on_hash_match: HashMatchPolicy::default(),
            },
            backend: BackendConfig::Local { root: mount },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = &self.server.prefix;
        if !prefix.is_empty() && !prefix.starts_with('/') {
            exn::bail!(ErrorKind::invalid("server.prefix", format!("`{prefix}` must start with `/`")));
        }
        if self.cache.enabled && self.cache.path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::invalid("cache.path", "must not be empty"));
        }
        self.backend.validate()
    }
}

impl BackendConfig {
    /// Name used in logs and user-facing messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Server { .. } => "server",
            Self::Dropbox { .. } => "Dropbox",
            Self::S3 { .. } => "S3",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Local { root } => absolute("backend.root", root),
            Self::Server { url } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                exn::bail!(ErrorKind::invalid("backend.url", format!("`{url}` is not an http(s) URL")))
            },
            Self::Server { .. } => Ok(()),
            Self::Dropbox { client_id, access_token, .. } => {
                required("backend.client_id", client_id)?;
                required("backend.access_token", access_token)
            },
            Self::S3 { bucket, region, key_id, key_secret, .. } => {
                required("backend.bucket", bucket)?;
                required("backend.region", region)?;
                required("backend.key_id", key_id)?;
                required("backend.key_secret", key_secret)
            },
        }
    }
}

fn required(key: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        exn::bail!(ErrorKind::invalid(key, "must not be empty"));
    }
    Ok(())
}

fn absolute(key: &'static str, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        exn::bail!(ErrorKind::invalid(key, format!("`{}` must be an absolute path", path.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_defaults() {
        let config = Config::defaults(None);
        assert!(config.server.mount.ends_with("songbook/files"));
        assert!(config.cache.path.ends_with("songbook/offline-cache.sqlite"));
        assert_eq!(config.backend, BackendConfig::Local { root: config.server.mount.clone() });
        config.validate().unwrap();
    }

    #[test]
    fn test_backend_json_shape() {
        use figment::providers::{Format, Json};
        let json = r#"{"kind": "dropbox", "client_id": "app", "access_token": "t"}"#;
        let backend: BackendConfig = figment::Figment::from(Json::string(json)).extract().unwrap();
        assert_eq!(backend.name(), "Dropbox");
        assert!(matches!(backend, BackendConfig::Dropbox { refresh_token: None, .. }));
    }
}
