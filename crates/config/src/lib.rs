//! Layered configuration.
//!
//! In increasing precedence:
//! 1. built-in defaults, with paths under the platform directories,
//! 2. a config file (`songbook.toml`, `.yaml`, `.yml` or `.json`; the format
//!    follows the extension),
//! 3. environment variables prefixed `SONGBOOK_`, nested keys separated by
//!    `__` (`SONGBOOK_SERVER__BIND=0.0.0.0:8080`).
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:6543"
//! mount = "/srv/songs"
//!
//! [cache]
//! on_hash_match = "refresh"
//!
//! [backend]
//! kind = "server"
//! url = "http://songs.local:6543/fs-server"
//! ```

pub mod error;
mod models;

pub use crate::models::{BackendConfig, CacheConfig, Config, ServerConfig};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SONGBOOK_";
const FILE_STEM: &str = "songbook";
const FILE_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

/// Platform directories for songbook, if the platform has a home directory.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "songbook")
}

/// Builds a [`Config`] from defaults, a file and the environment.
#[derive(Debug, Clone)]
pub struct Loader {
    dirs: Option<ProjectDirs>,
    file: Option<PathBuf>,
    search_default_file: bool,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self { dirs: project_dirs(), file: None, search_default_file: true }
    }

    /// Read this file instead of looking in the platform config directory.
    /// Unlike the default location, it must exist.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Do not look for a config file in the platform config directory.
    pub fn without_default_file(mut self) -> Self {
        self.search_default_file = false;
        self
    }

    /// The first `songbook.{toml,yaml,yml,json}` in the config directory.
    pub fn default_file(&self) -> Option<PathBuf> {
        let dir = self.dirs.as_ref()?.config_dir();
        FILE_EXTENSIONS.iter().map(|ext| dir.join(format!("{FILE_STEM}.{ext}"))).find(|path| path.is_file())
    }

    pub fn figment(&self) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::defaults(self.dirs.as_ref())));
        let file = match &self.file {
            Some(file) if !file.is_file() => exn::bail!(ErrorKind::MissingFile(file.display().to_string())),
            Some(file) => Some(file.clone()),
            None if self.search_default_file => self.default_file(),
            None => None,
        };
        if let Some(file) = file {
            tracing::debug!(file = %file.display(), "Reading configuration file");
            figment = merge_file(figment, &file)?;
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn load(&self) -> Result<Config> {
        let config: Config = self.figment()?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }
}

fn merge_file(figment: Figment, file: &Path) -> Result<Figment> {
    let extension = file.extension().and_then(|ext| ext.to_str()).unwrap_or_default().to_ascii_lowercase();
    Ok(match extension.as_str() {
        "toml" => figment.merge(Toml::file(file)),
        "yaml" | "yml" => figment.merge(Yaml::file(file)),
        "json" => figment.merge(Json::file(file)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(file.display().to_string())),
    })
}

/// Load the configuration the way the binary does: platform defaults, the
/// given file (or the default one) and the environment.
pub fn load(file: Option<&Path>) -> Result<Config> {
    match file {
        Some(file) => Loader::new().file(file).load(),
        None => Loader::new().load(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use songbook_cache::HashMatchPolicy;
    use std::net::SocketAddr;

    fn loader() -> Loader {
        Loader::new().without_default_file()
    }

    #[test]
    fn test_defaults_are_valid() {
        Jail::expect_with(|_| {
            let config = loader().load().unwrap();
            assert_eq!(config.server.bind, "127.0.0.1:6543".parse::<SocketAddr>().unwrap());
            assert_eq!(config.server.prefix, "/fs-server");
            assert!(config.cache.enabled);
            assert_eq!(config.cache.on_hash_match, HashMatchPolicy::Skip);
            assert!(config.cache.path.ends_with("offline-cache.sqlite"));
            assert!(matches!(config.backend, BackendConfig::Local { .. }));
            Ok(())
        });
    }

    #[rstest]
    #[case("songbook.toml", "[server]\nbind = \"0.0.0.0:8080\"\n[cache]\non_hash_match = \"refresh\"\n")]
    #[case("songbook.yaml", "server:\n  bind: 0.0.0.0:8080\ncache:\n  on_hash_match: refresh\n")]
    #[case("songbook.json", r#"{"server": {"bind": "0.0.0.0:8080"}, "cache": {"on_hash_match": "refresh"}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(name);
        std::fs::write(&file, contents).unwrap();
        Jail::expect_with(|_| {
            let config = loader().file(&file).load().unwrap();
            assert_eq!(config.server.bind.port(), 8080);
            assert_eq!(config.cache.on_hash_match, HashMatchPolicy::Refresh);
            // Untouched sections keep their defaults.
            assert_eq!(config.server.prefix, "/fs-server");
            Ok(())
        });
    }

    #[test]
    fn test_environment_wins() {
        Jail::expect_with(|jail| {
            jail.create_file("songbook.toml", "[server]\nbind = \"0.0.0.0:8080\"\n")?;
            jail.set_env("SONGBOOK_SERVER__BIND", "127.0.0.1:9000");
            jail.set_env("SONGBOOK_BACKEND__KIND", "server");
            jail.set_env("SONGBOOK_BACKEND__URL", "http://songs.local/fs-server");
            let config = loader().file("songbook.toml").load().unwrap();
            assert_eq!(config.server.bind.port(), 9000);
            assert!(matches!(&config.backend, BackendConfig::Server { url } if url == "http://songs.local/fs-server"));
            Ok(())
        });
    }

    #[test]
    fn test_tagged_backend() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "songbook.toml",
                "[backend]\nkind = \"s3\"\nbucket = \"songs\"\nregion = \"eu-west-1\"\nkey_id = \"AKIA\"\nkey_secret = \"shh\"\n",
            )?;
            let config = loader().file("songbook.toml").load().unwrap();
            let BackendConfig::S3 { bucket, prefix, endpoint, .. } = config.backend else {
                panic!("expected an S3 backend");
            };
            assert_eq!(bucket, "songs");
            assert_eq!(prefix, None);
            assert_eq!(endpoint, None);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = loader().file("/nonexistent/songbook.toml").load().unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingFile(_)));
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("songbook.ini");
        std::fs::write(&file, "bind = 1").unwrap();
        let err = loader().file(&file).load().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[rstest]
    #[case("[server]\nprefix = \"fs-server\"\n", "server.prefix")]
    #[case("[backend]\nkind = \"server\"\nurl = \"ftp://songs.local\"\n", "backend.url")]
    #[case("[backend]\nkind = \"local\"\nroot = \"relative/songs\"\n", "backend.root")]
    #[case("[backend]\nkind = \"dropbox\"\nclient_id = \"\"\naccess_token = \"t\"\n", "backend.client_id")]
    fn test_validation_names_the_key(#[case] contents: &str, #[case] expected: &str) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("songbook.toml");
        std::fs::write(&file, contents).unwrap();
        Jail::expect_with(|_| {
            let err = loader().file(&file).load().unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid { key, .. } if *key == expected), "{err:?}");
            Ok(())
        });
    }

    #[test]
    fn test_type_errors_fail_to_load() {
        Jail::expect_with(|jail| {
            jail.set_env("SONGBOOK_SERVER__BIND", "not an address");
            let err = loader().load().unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }
}
