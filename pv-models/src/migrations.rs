//! Versioned database migrations.
//!
//! Migrations run sequentially from the current stored version to the latest.
//! `migrate` is safe to run on every open: it also makes sure the metadata
//! row exists, which a store downloaded from another device already has.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use pv_core::constants::DB_SCHEMA_VERSION;
use pv_core::error::{PvError, PvResult};

use crate::models::store_info::StoreInfo;
use crate::schema;

/// Bring the store schema up to date and seed the metadata row.
///
/// Runs in a single transaction; `now` stamps a freshly created metadata row.
pub fn migrate(conn: &Connection, now: i64) -> PvResult<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| PvError::Migration(e.to_string()))?;

    schema::create_tables(&tx)?;
    run_migrations(&tx)?;

    if StoreInfo::ensure(&tx, now)? {
        info!("created store metadata row (last_modified={now})");
    }

    tx.commit().map_err(|e| PvError::Migration(e.to_string()))?;
    Ok(())
}

/// Run all pending versioned migrations.
pub fn run_migrations(conn: &Connection) -> PvResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version >= DB_SCHEMA_VERSION {
        debug!("store schema is up to date (version {current_version})");
        return Ok(());
    }

    info!("running migrations from version {current_version} to {DB_SCHEMA_VERSION}");

    for version in (current_version + 1)..=DB_SCHEMA_VERSION {
        run_migration(conn, version)?;
    }

    set_schema_version(conn, DB_SCHEMA_VERSION)?;
    info!("migrations complete, schema at version {DB_SCHEMA_VERSION}");
    Ok(())
}

/// Current schema version, inserting version 0 on a fresh store.
pub fn get_schema_version(conn: &Connection) -> PvResult<i32> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| PvError::Migration(e.to_string()))?;

    if count == 0 {
        conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])
            .map_err(|e| PvError::Migration(e.to_string()))?;
        return Ok(0);
    }

    conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map_err(|e| PvError::Migration(e.to_string()))
}

fn set_schema_version(conn: &Connection, version: i32) -> PvResult<()> {
    conn.execute("UPDATE schema_version SET version = ?1", [version])
        .map_err(|e| PvError::Migration(e.to_string()))?;
    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> PvResult<()> {
    info!("applying migration version {version}");

    match version {
        1 => migration_v1(conn),
        _ => {
            warn!("unknown migration version {version}, skipping");
            Ok(())
        }
    }
}

/// Migration v1: patient records.
fn migration_v1(conn: &Connection) -> PvResult<()> {
    conn.execute_batch(schema::PATIENTS_SQL)
        .map_err(|e| PvError::Migration(format!("migration v1 failed: {e}")))
}
