//! SQLite schema definitions.
//!
//! `create_tables` only lays down the bookkeeping tables; record tables are
//! introduced by versioned migrations so an old store picks them up on open.

use rusqlite::Connection;
use pv_core::error::{PvError, PvResult};

/// Create the bookkeeping tables if they do not exist.
pub fn create_tables(conn: &Connection) -> PvResult<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| PvError::Migration(format!("failed to create schema: {e}")))?;
    Ok(())
}

/// Whether a table with the given name exists in the main schema.
pub fn table_exists(conn: &Connection, table: &str) -> PvResult<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .map_err(|e| PvError::ReadFailed(e.to_string()))?;
    Ok(count > 0)
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_info (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_modified INTEGER NOT NULL,
    version TEXT NOT NULL DEFAULT '1.0'
);
";

/// Patient records, added by migration v1.
pub(crate) const PATIENTS_SQL: &str = "
CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    date_of_birth TEXT NOT NULL,
    medical_record_number TEXT NOT NULL UNIQUE,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(last_name, first_name);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        assert!(table_exists(&conn, "store_info").unwrap());
        assert!(table_exists(&conn, "schema_version").unwrap());
        assert!(!table_exists(&conn, "patients").unwrap());
    }
}
