use clap::{Parser, Subcommand, ValueEnum};
use songbook_storage::SaveMode;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "songbook", version)]
#[command(about = "Chord sheet file store with an offline cache")]
pub struct Cli {
    /// Configuration file (toml, yaml or json).
    #[arg(long, short, global = true, env = "SONGBOOK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Bypass the offline cache for this invocation.
    #[arg(long, global = true)]
    pub no_cache: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve a local directory over the file-store protocol
    Serve {
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Directory to serve
        #[arg(long)]
        mount: Option<PathBuf>,
        /// Route prefix, empty for none
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Inspect or clear the offline cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that run against the configured backend.
#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// List a folder
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file
    Cat { path: String },
    /// Upload a local file
    Put {
        /// Local file to read
        source: PathBuf,
        /// Destination path in the store
        path: String,
        #[arg(long, value_enum, default_value_t = Mode::Overwrite)]
        mode: Mode,
    },
    /// Move or rename a file or folder
    Mv { from: String, to: String },
    /// Create a folder and any missing parents
    Mkdir { path: String },
    /// Delete a file or folder
    Rm { path: String },
    /// Download a folder as a zip archive
    Zip {
        path: String,
        /// Defaults to the folder name in the working directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Number of cached files and their approximate size
    Stats,
    /// Forget everything
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Replace whatever is there
    Overwrite,
    /// Pick a free name if the path is taken
    Add,
    /// Replace only the revision that was just read
    Update,
}

impl From<Mode> for SaveMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Overwrite => SaveMode::Overwrite,
            Mode::Add => SaveMode::Add,
            Mode::Update => SaveMode::Update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["songbook", "ls"], "/")]
    #[case(&["songbook", "ls", "/Songs"], "/Songs")]
    #[case(&["songbook", "--no-cache", "ls", "/Songs"], "/Songs")]
    fn test_ls(#[case] args: &[&str], #[case] expected: &str) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(cli.command, Command::Store(StoreCommand::Ls { path }) if path == expected));
    }

    #[test]
    fn test_put_mode() {
        let cli = Cli::try_parse_from(["songbook", "put", "a.chopro", "/Songs/a.chopro", "--mode", "add"]).unwrap();
        let Command::Store(StoreCommand::Put { mode, .. }) = cli.command else {
            panic!("expected put");
        };
        assert_eq!(SaveMode::from(mode), SaveMode::Add);
    }

    #[test]
    fn test_config_is_global() {
        let cli = Cli::try_parse_from(["songbook", "cache", "stats", "--config", "/etc/songbook.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/songbook.toml")));
        assert!(matches!(cli.command, Command::Cache { command: CacheCommand::Stats }));
    }
}
