//! Sync commands.

use std::time::Duration;

use clap::Subcommand;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use pv_core::config::ConfigHandle;
use pv_core::error::{PvError, PvResult};
use pv_services::{AppEvent, SyncOutcome};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum SyncAction {
    /// Run one sync cycle: pull the remote snapshot if it is newer.
    Once,
    /// Upload the local store as the remote snapshot.
    Push,
    /// Show sync status and both timestamps.
    Status,
    /// Run the periodic sync timer until interrupted.
    Watch {
        /// Seconds between cycles (overrides config).
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub async fn run(config: ConfigHandle, action: SyncAction, format: OutputFormat) -> PvResult<()> {
    if let SyncAction::Watch { interval: Some(secs) } = &action {
        config.write().await.sync.interval_secs = (*secs).max(1);
    }

    let ctx = super::open_context(&config).await?;
    let result: PvResult<()> = async {
        let sync = ctx.coordinator()?.clone();

        match action {
            SyncAction::Once => {
                let pb = spinner("Checking remote snapshot...");
                let outcome = sync.sync_now().await;
                pb.finish_and_clear();
                report_outcome(&outcome, format)?;
                match outcome {
                    SyncOutcome::Failed(e) => Err(e),
                    _ => Ok(()),
                }
            }
            SyncAction::Push => {
                let pb = spinner("Uploading snapshot...");
                let pushed = sync.push().await;
                pb.finish_and_clear();
                let blob = pushed?;
                let last_modified = blob.last_modified().ok();
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "status": "pushed",
                        "blob_id": blob.id,
                        "last_modified": last_modified,
                    })),
                    OutputFormat::Text => {
                        println!("  {} Uploaded snapshot {}.", style("OK").green().bold(), blob.id);
                        if let Some(ts) = last_modified {
                            println!("  lastModified:  {} ({})", ts, super::format_timestamp(ts));
                        }
                        Ok(())
                    }
                }
            }
            SyncAction::Status => {
                let state = sync.status();
                let local = ctx.store.current_timestamp()?;
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "state": state,
                        "local_last_modified": local,
                        "backend": ctx.config.read().await.remote.backend,
                        "blob_name": sync.settings().blob_name,
                    })),
                    OutputFormat::Text => {
                        println!("{}", style("Sync Status").bold().underlined());
                        println!("  Backend:        {:?}", ctx.config.read().await.remote.backend);
                        println!("  Snapshot name:  {}", sync.settings().blob_name);
                        println!("  Local stamp:    {} ({})", local, super::format_timestamp(local));
                        println!("  Status:         {}", state.status);
                        match state.last_sync {
                            Some(at) => println!("  Last sync:      {}", at.to_rfc3339()),
                            None => println!("  Last sync:      never (this process)"),
                        }
                        Ok(())
                    }
                }
            }
            SyncAction::Watch { .. } => {
                let mut rx = ctx.event_bus.subscribe();
                sync.start();
                println!(
                    "  {} Watching (every {}s). Press Ctrl+C to stop.",
                    style("SYNC").cyan().bold(),
                    sync.settings().interval.as_secs()
                );

                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        event = rx.recv() => match event {
                            Ok(event) => print_event(&event, format)?,
                            Err(RecvError::Lagged(n)) => {
                                println!("  {} {} events dropped", style("WARN").yellow().bold(), n);
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
                sync.stop();
                Ok(())
            }
        }
    }
    .await;

    ctx.shutdown();
    result
}

fn report_outcome(outcome: &SyncOutcome, format: OutputFormat) -> PvResult<()> {
    match format {
        OutputFormat::Json => {
            let (status, detail) = match outcome {
                SyncOutcome::Pulled { remote_last_modified } => {
                    ("pulled", serde_json::json!({ "remote_last_modified": remote_last_modified }))
                }
                SyncOutcome::UpToDate => ("up_to_date", serde_json::Value::Null),
                SyncOutcome::InitialPush { blob_id, last_modified } => (
                    "initial_push",
                    serde_json::json!({ "blob_id": blob_id, "last_modified": last_modified }),
                ),
                SyncOutcome::Skipped => ("skipped", serde_json::Value::Null),
                SyncOutcome::Failed(e) => ("failed", serde_json::json!({ "error": e.to_string() })),
            };
            super::print_json(&serde_json::json!({ "status": status, "detail": detail }))
        }
        OutputFormat::Text => {
            let label = match outcome {
                SyncOutcome::Failed(_) => style("FAIL").red().bold(),
                SyncOutcome::Skipped => style("SKIP").yellow().bold(),
                _ => style("OK").green().bold(),
            };
            println!("  {} {}", label, outcome);
            Ok(())
        }
    }
}

fn print_event(event: &AppEvent, format: OutputFormat) -> PvResult<()> {
    if format == OutputFormat::Json {
        let value = match event {
            AppEvent::SyncStatusChanged { status, in_progress } => {
                serde_json::json!({ "event": "sync_status", "status": status, "in_progress": in_progress })
            }
            AppEvent::StoreReplaced { remote_last_modified } => {
                serde_json::json!({ "event": "store_replaced", "remote_last_modified": remote_last_modified })
            }
            AppEvent::StoreFault { message } => {
                serde_json::json!({ "event": "store_fault", "message": message })
            }
            AppEvent::SnapshotPushed { blob_id, last_modified } => {
                serde_json::json!({ "event": "snapshot_pushed", "blob_id": blob_id, "last_modified": last_modified })
            }
            other => serde_json::json!({ "event": format!("{other:?}") }),
        };
        return super::print_json(&value);
    }

    let now = chrono::Local::now().format("%H:%M:%S");
    match event {
        AppEvent::SyncStatusChanged { status, in_progress: false } => {
            println!("  [{now}] {status}");
        }
        AppEvent::StoreReplaced { remote_last_modified } => {
            println!(
                "  [{now}] {} Local store replaced by remote snapshot ({})",
                style("PULL").cyan().bold(),
                super::format_timestamp(*remote_last_modified)
            );
        }
        AppEvent::SnapshotPushed { blob_id, .. } => {
            println!("  [{now}] {} Uploaded snapshot {blob_id}", style("PUSH").cyan().bold());
        }
        AppEvent::StoreFault { message } => {
            println!("  [{now}] {} {message}", style("FAULT").red().bold());
            return Err(PvError::StoreUnavailable(message.clone()));
        }
        _ => {}
    }
    Ok(())
}
