//! Patient Vault CLI - command-line front end for the encrypted patient store.
//!
//! Manages patient records in the local store, runs and watches the
//! last-write-wins sync with the shared remote snapshot, and exposes the
//! store maintenance operations (export, encryption toggle, replacement).

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use pv_core::config::{AppConfig, ConfigHandle};
use pv_core::error::PvResult;
use pv_core::logging;

/// Patient Vault - encrypted patient records synced across devices.
#[derive(Parser)]
#[command(
    name = "patientvault",
    version,
    about = "Patient Vault command-line interface",
    long_about = "Manage an encrypted local patient store and keep it in sync with a\n\
                  shared snapshot in Google Drive or a shared folder."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output for scripting.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Add, list, edit and delete patient records.
    Patients {
        #[command(subcommand)]
        action: commands::patients::PatientsAction,
    },
    /// Synchronize with the remote snapshot.
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Local store maintenance.
    Db {
        #[command(subcommand)]
        action: commands::db::DbAction,
    },
    /// Show or create the configuration file.
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> PvResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_config_path()?,
    };
    let config = if config_path.exists() {
        AppConfig::load_from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    // Initialize logging
    let mut log_config = config.logging.clone();
    if cli.verbose {
        log_config.level = "debug".to_string();
    }
    let log_dir = config
        .effective_log_dir()
        .unwrap_or_else(|_| PathBuf::from("logs"));
    let _guard = logging::init_logging(&log_config, &log_dir)?;

    info!("Patient Vault CLI v{}", pv_core::constants::APP_VERSION);

    let config_handle = ConfigHandle::new(config);

    match cli.command {
        Commands::Patients { action } => {
            commands::patients::run(config_handle, action, cli.format).await
        }
        Commands::Sync { action } => {
            commands::sync::run(config_handle, action, cli.format).await
        }
        Commands::Db { action } => {
            commands::db::run(config_handle, action, cli.format).await
        }
        Commands::Config { action } => {
            commands::config::run(config_handle, &config_path, action, cli.format).await
        }
    }
}
