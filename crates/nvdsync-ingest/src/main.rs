//! nvdsync - NVD CVE synchronization tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nvdsync_common::logging::{init_logging, LogConfig, LogLevel};
use nvdsync_ingest::provider::{NvdProvider, SyncState};
use nvdsync_ingest::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nvdsync")]
#[command(author, version, about = "Incremental NVD CVE synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML settings file
    #[arg(short, long, global = true, env = "NVDSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize the workspace with the upstream feed
    Run {
        /// Workspace directory
        #[arg(short, long, default_value = "./data/nvd")]
        workspace: PathBuf,

        /// Skip identifiers that already have a stored result
        #[arg(long)]
        skip_if_exists: bool,

        /// Ignore the stored watermark and fetch every year
        #[arg(long)]
        full: bool,
    },

    /// Print the resolved settings
    Config,

    /// Print the state of the last successful run
    Status {
        /// Workspace directory
        #[arg(short, long, default_value = "./data/nvd")]
        workspace: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("nvdsync")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            workspace,
            skip_if_exists,
            full,
        } => {
            let config = Arc::new(
                settings
                    .to_sync_config()
                    .context("invalid synchronization settings")?,
            );
            info!(config = %config, "Loaded configuration");

            let provider = NvdProvider::new(&workspace, config)?;
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

            let state = provider
                .run(skip_if_exists || settings.skip_if_exists, full, cancel)
                .await
                .with_context(|| format!("sync of {} failed", workspace.display()))?;

            info!(
                count = state.count,
                urls = state.urls.len(),
                last_updated = ?state.last_updated,
                "Synchronization complete"
            );
        },
        Command::Config => {
            println!("{settings}");
        },
        Command::Status { workspace } => match SyncState::load(&workspace).await? {
            Some(state) => {
                let last_updated = state
                    .last_updated
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("provider:     {}", state.provider);
                println!("last_updated: {last_updated}");
                println!("records:      {}", state.count);
                println!("urls:         {}", state.urls.len());
            },
            None => println!("No successful run recorded in {}", workspace.display()),
        },
    }

    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupt received, cancelling run");
        cancel.cancel();
    }
}
