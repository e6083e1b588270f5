//! CLI command implementations.

pub mod config;
pub mod db;
pub mod patients;
pub mod sync;

use chrono::{DateTime, Local, NaiveDate};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use pv_core::config::ConfigHandle;
use pv_core::error::{PvError, PvResult};
use pv_services::AppContext;

/// Build the application context and open the store.
///
/// The context gets its own copy of the configuration with `auto_sync`
/// off: one-shot commands never run the background timer, and `sync watch`
/// starts it explicitly.
pub async fn open_context(config: &ConfigHandle) -> PvResult<AppContext> {
    let mut snapshot = config.snapshot().await;
    snapshot.sync.auto_sync = false;
    let ctx = AppContext::build(ConfigHandle::new(snapshot)).await?;
    ctx.start().await?;
    Ok(ctx)
}

/// A table with the CLI's standard look.
pub fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> PvResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a `YYYY-MM-DD` date argument.
pub fn parse_date(value: &str) -> PvResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| PvError::ValidationFailed(format!("invalid date {value:?} (expected YYYY-MM-DD): {e}")))
}

/// Render a store timestamp in local time.
pub fn format_timestamp(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Truncate a string to a maximum number of characters, appending an
/// ellipsis if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a rather long note", 10), "a rathe...");
        assert_eq!(truncate("émigré patient", 6), "émi...");
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("1990-02-28").unwrap(), NaiveDate::from_ymd_opt(1990, 2, 28).unwrap());
        assert!(matches!(parse_date("28/02/1990"), Err(PvError::ValidationFailed(_))));
    }
}
