//! Dealer API command-line client
//!
//! Single binary that:
//! 1. Loads `dealer-api.toml` (or `--config` / `DEALER_CONFIG`)
//! 2. Restores persisted credentials from the configured file
//! 3. Runs one command through the authenticated request pipeline

mod commands;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dealer_auth::{CredentialStore, FileKeyValueStore};
use dealer_client::{ApiClient, spawn_refresh_task};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::ReqwestTransport;

use crate::commands::Command;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "dealer-api", version, about = "Authenticated dealer API client")]
struct Cli {
    /// Config file (defaults to $DEALER_CONFIG, then ./dealer-api.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr so stdout carries only command output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        base_url = %config.api.base_url,
        "configuration loaded"
    );

    let credentials_path = &config.auth.credentials_path;
    let backend = FileKeyValueStore::open(credentials_path).with_context(|| {
        format!(
            "failed to open credentials file {}",
            credentials_path.display()
        )
    })?;
    let store = Arc::new(CredentialStore::load(Arc::new(backend)));

    let transport = ReqwestTransport::try_default().context("failed to build HTTP transport")?;
    let client = ApiClient::new(config.client_config()?, Arc::new(transport), store);
    client.on_auth_expired(|| warn!("session expired, run `dealer-api login` again"));

    let output = match cli.command {
        Command::Login(args) => commands::login(&client, args)?,
        Command::Logout => commands::logout(&client),
        Command::Status => commands::status(&client),
        Command::Refresh => commands::refresh(&client).await?,
        Command::Request(args) => {
            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            let background = config
                .auth
                .background_refresh_secs
                .map(|secs| spawn_refresh_task(client.clone(), Duration::from_secs(secs)));

            let result = commands::request(&client, args, cancel).await;
            if let Some(task) = background {
                task.abort();
            }
            result?
        }
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C so the in-flight request ends with CANCELLED.
fn spawn_ctrl_c_handler(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, cancelling request");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });
}
