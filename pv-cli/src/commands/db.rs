//! Local store maintenance commands.

use std::path::PathBuf;

use clap::Subcommand;
use console::style;
use dialoguer::Confirm;

use pv_core::config::ConfigHandle;
use pv_core::error::{PvError, PvResult};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum DbAction {
    /// Show store statistics.
    Info,
    /// Export a self-contained copy of the store.
    Export {
        /// Target directory (defaults to the configured export directory).
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Re-encrypt the store with encryption switched on or off.
    ToggleEncryption {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Replace the whole store with another store file.
    Replace {
        /// Candidate store file. It is copied, never moved.
        candidate: PathBuf,
        #[arg(short, long)]
        yes: bool,
    },
    /// Run an integrity check.
    Check,
    /// Show the store file path.
    Path,
}

fn confirm(prompt: String) -> PvResult<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| PvError::Internal(format!("prompt failed: {e}")))
}

pub async fn run(config: ConfigHandle, action: DbAction, format: OutputFormat) -> PvResult<()> {
    if let DbAction::Path = action {
        let path = config.read().await.effective_db_path()?;
        match format {
            OutputFormat::Json => {
                super::print_json(&serde_json::json!({ "path": path.display().to_string() }))?
            }
            OutputFormat::Text => println!("{}", path.display()),
        }
        return Ok(());
    }

    let ctx = super::open_context(&config).await?;
    let result: PvResult<()> = async {
        match action {
            DbAction::Info => {
                let stats = ctx.store.stats()?;
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "path": stats.path.display().to_string(),
                        "encrypted": stats.encrypted,
                        "patients": stats.patients,
                        "last_modified": stats.last_modified,
                        "journal_mode": stats.journal_mode,
                        "schema_version": stats.schema_version,
                        "file_size_bytes": stats.file_size,
                        "wal_size_bytes": stats.wal_size,
                        "shm_size_bytes": stats.shm_size,
                    })),
                    OutputFormat::Text => {
                        println!("{}", style("Store").bold().underlined());
                        println!("  Path:            {}", stats.path.display());
                        println!("  Encrypted:       {}", if stats.encrypted { "yes" } else { "no" });
                        println!("  Journal mode:    {}", stats.journal_mode);
                        println!("  Schema version:  {}", stats.schema_version);
                        match stats.last_modified {
                            Some(ts) => println!(
                                "  Last modified:   {} ({})",
                                ts,
                                super::format_timestamp(ts)
                            ),
                            None => println!("  Last modified:   -"),
                        }
                        println!();

                        let mut table = super::new_table();
                        table.set_header(vec!["Table", "Row Count"]);
                        table.add_row(vec!["patients".to_string(), stats.patients.to_string()]);
                        println!("{table}");

                        println!();
                        println!("{}", style("Storage").bold().underlined());
                        println!("  Database:        {}", super::format_bytes(stats.file_size));
                        if stats.wal_size > 0 {
                            println!("  WAL file:        {}", super::format_bytes(stats.wal_size));
                        }
                        if stats.shm_size > 0 {
                            println!("  SHM file:        {}", super::format_bytes(stats.shm_size));
                        }
                        Ok(())
                    }
                }
            }
            DbAction::Export { dir } => {
                let dir = match dir {
                    Some(dir) => dir,
                    None => ctx.export_dir().await?,
                };
                let dest = ctx.store.export_to_documents(&dir)?;
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "exported_to": dest.display().to_string(),
                    })),
                    OutputFormat::Text => {
                        println!("  {} Exported to {}", style("OK").green().bold(), dest.display());
                        Ok(())
                    }
                }
            }
            DbAction::ToggleEncryption { yes } => {
                let target = if ctx.store.is_encrypted() { "off" } else { "on" };
                if !yes && !confirm(format!("Turn encryption {target} and rewrite the store?"))? {
                    println!("  Cancelled.");
                    return Ok(());
                }

                let enabled = ctx.toggle_encryption().await?;
                match format {
                    OutputFormat::Json => {
                        super::print_json(&serde_json::json!({ "encrypted": enabled }))
                    }
                    OutputFormat::Text => {
                        println!(
                            "  {} Encryption is now {}.",
                            style("OK").green().bold(),
                            if enabled { "on" } else { "off" }
                        );
                        println!(
                            "  Set database.encrypted = {enabled} in the config file to keep this setting."
                        );
                        Ok(())
                    }
                }
            }
            DbAction::Replace { candidate, yes } => {
                if !yes
                    && !confirm(format!(
                        "Replace every record in the store with {}?",
                        candidate.display()
                    ))?
                {
                    println!("  Cancelled.");
                    return Ok(());
                }

                ctx.store.replace_with(&candidate)?;
                let patients = ctx.repository.load_all()?.len();
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "replaced_from": candidate.display().to_string(),
                        "patients": patients,
                    })),
                    OutputFormat::Text => {
                        println!(
                            "  {} Store replaced from {} ({} patients).",
                            style("OK").green().bold(),
                            candidate.display(),
                            patients
                        );
                        Ok(())
                    }
                }
            }
            DbAction::Check => {
                println!("  {} Running integrity check...", style("...").dim());
                match ctx.store.integrity_check() {
                    Ok(()) => {
                        println!("  {} Integrity check passed.", style("OK").green().bold());
                        Ok(())
                    }
                    Err(e) => {
                        println!("  {} Integrity check failed: {}", style("FAIL").red().bold(), e);
                        Err(e)
                    }
                }
            }
            DbAction::Path => Ok(()),
        }
    }
    .await;

    ctx.shutdown();
    result
}
