//! Configuration commands.

use std::path::Path;

use clap::Subcommand;
use console::style;

use pv_core::config::{AppConfig, ConfigHandle, ENV_ACCESS_TOKEN, ENV_ENCRYPTION_KEY};
use pv_core::error::{PvError, PvResult};
use pv_core::platform::Platform;

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration (secrets masked).
    Show,
    /// Show the configuration file path.
    Path,
    /// Write the current configuration to the configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Copy of `config` safe to print.
fn masked(config: &AppConfig) -> AppConfig {
    let mut shown = config.clone();
    if !shown.database.encryption_key.is_empty() {
        shown.database.encryption_key = "********".into();
    }
    if !shown.remote.access_token.is_empty() {
        shown.remote.access_token = "********".into();
    }
    shown
}

pub async fn run(
    config: ConfigHandle,
    config_path: &Path,
    action: ConfigAction,
    format: OutputFormat,
) -> PvResult<()> {
    match action {
        ConfigAction::Show => {
            let shown = masked(&config.snapshot().await);
            match format {
                OutputFormat::Json => super::print_json(&shown)?,
                OutputFormat::Text => {
                    let toml = toml_string(&shown)?;
                    println!(
                        "{} ({})",
                        style(config_path.display()).dim(),
                        Platform::current()
                    );
                    println!("{toml}");
                    for var in [ENV_ENCRYPTION_KEY, ENV_ACCESS_TOKEN] {
                        if std::env::var(var).is_ok_and(|v| !v.is_empty()) {
                            println!("  {} {var} is set and overrides the file", style("ENV").cyan().bold());
                        }
                    }
                }
            }
        }
        ConfigAction::Path => match format {
            OutputFormat::Json => super::print_json(&serde_json::json!({
                "path": config_path.display().to_string(),
                "exists": config_path.exists(),
            }))?,
            OutputFormat::Text => println!("{}", config_path.display()),
        },
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                return Err(PvError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                )));
            }
            config.save_to(config_path).await?;
            println!("  {} Wrote {}", style("OK").green().bold(), config_path.display());
        }
    }
    Ok(())
}

fn toml_string(config: &AppConfig) -> PvResult<String> {
    toml::to_string_pretty(config).map_err(|e| PvError::Config(format!("failed to serialize config: {e}")))
}
