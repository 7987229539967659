mod cli;
mod commands;
mod error;
mod open;

use crate::cli::{Cli, Command, StoreCommand};
use crate::error::{ErrorKind, Result};
use crate::open::{open_cache, open_store};
use clap::Parser;
use exn::ResultExt;
use songbook_config::Config;
use songbook_library::Session;
use songbook_storage::CacheHandle;
use songbook_storage::backend::LocalStore;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &*err {
                // Already phrased for the user; the tree is for debugging.
                ErrorKind::Failed(message) => {
                    tracing::debug!(error = ?err, "Command failed");
                    eprintln!("{message}");
                },
                _ => eprintln!("error: {err:?}"),
            }
            ExitCode::FAILURE
        },
    }
}

/// `RUST_LOG` wins over the `info` default. Logs go to stderr so that `cat`
/// output stays clean.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(std::io::stderr)).init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = songbook_config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    if cli.no_cache {
        config.cache.enabled = false;
    }
    match cli.command {
        Command::Serve { bind, mount, prefix } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(mount) = mount {
                config.server.mount = mount;
            }
            if let Some(prefix) = prefix {
                config.server.prefix = prefix;
            }
            serve(&config).await
        },
        Command::Cache { command } => {
            let cache = open_cache(&config.cache).await?;
            commands::cache(cache.as_deref(), command).await
        },
        Command::Store(command) => {
            let cache = open_cache(&config.cache).await?;
            let handle = cache.clone().map(|cache| -> CacheHandle { cache });
            let opened = open_store(&config.backend, handle).await?;
            tracing::debug!(backend = opened.store.name(), cached = cache.is_some(), "Opened file store");
            let session = Session::new(opened.store);
            let result = match command {
                StoreCommand::Ls { path } => commands::ls(&session, cache.as_deref(), &path).await,
                StoreCommand::Cat { path } => commands::cat(&session, &path).await,
                StoreCommand::Put { source, path, mode } => commands::put(&session, &source, &path, mode).await,
                StoreCommand::Mv { from, to } => commands::mv(&session, &from, &to).await,
                StoreCommand::Mkdir { path } => commands::mkdir(&session, &path).await,
                StoreCommand::Rm { path } => commands::rm(&session, &path).await,
                StoreCommand::Zip { path, output } => commands::zip(&session, &path, output).await,
            };
            // Mirror writes are background tasks; let them land before exiting.
            opened.writes.settle().await;
            result
        },
    }
}

async fn serve(config: &Config) -> Result<()> {
    let server = &config.server;
    let store = LocalStore::new("local", &server.mount).or_raise(|| ErrorKind::Backend("local"))?;
    let app = songbook_server::router(std::sync::Arc::new(store), &server.prefix);
    let listener = tokio::net::TcpListener::bind(server.bind)
        .await
        .or_raise(|| ErrorKind::Serve(server.bind.to_string()))?;
    tracing::info!(mount = %server.mount.display(), prefix = %server.prefix, "Starting file-store server");
    songbook_server::serve(listener, app, shutdown_signal()).await.or_raise(|| ErrorKind::Serve(server.bind.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Unable to listen for Ctrl-C; stopping");
        return;
    }
    tracing::info!("Shutting down");
}
