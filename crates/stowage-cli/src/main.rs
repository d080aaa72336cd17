//! Stowage - an offline-first inventory on the command line.
//!
//! Changes are applied to the local cache immediately and queued for the
//! server; `stowage sync` delivers them. Local state, including a halted
//! sync, is kept in the data directory between runs.

mod commands;
mod format;
mod models;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stowage_core::auth::TokenStore;
use stowage_core::{Config, FileStore, Registry, RegistrySettings};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

/// Log file name inside the data directory
const LOG_FILE_PREFIX: &str = "stowage.log";

#[derive(Debug, Parser)]
#[command(name = "stowage", version, about = "Offline-first inventory")]
struct Cli {
    /// Server API root (overrides config and STOWAGE_API_ROOT)
    #[arg(long, global = true)]
    api_root: Option<String>,

    /// Directory for local data and logs (overrides config and STOWAGE_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(api_root) = cli.api_root {
        config.api_root = api_root;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = Some(data_dir);
    }

    let data_dir = config.data_dir()?;
    let store = FileStore::new(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let _log_guard = init_tracing(&data_dir);
    info!(data_dir = %data_dir.display(), api_root = %config.api_root, "Stowage starting");

    // The keychain token is used for requests but never written back to the config file
    let token = TokenStore::resolve(&config.api_root, config.token.clone());

    // Commands drive sync themselves, one flush at a time
    let settings = RegistrySettings::from(&config)
        .with_token(token)
        .with_autostart(false);
    let registry = Registry::new(settings, Arc::new(store))?;

    let result = commands::run(cli.command, &config, &registry).await;

    // Persist local changes whatever the command did
    registry.shutdown().await;
    info!("Stowage shutting down");
    result
}
