//! Store metadata singleton.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use pv_core::constants::{STORE_FORMAT_VERSION, STORE_INFO_ID};
use pv_core::error::{PvError, PvResult};

/// The single metadata row describing the whole store.
///
/// `last_modified` is the logical timestamp compared during sync; every
/// committed mutation moves it forward in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub last_modified: i64,
    pub version: String,
}

impl StoreInfo {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            last_modified: row.get("last_modified")?,
            version: row.get("version")?,
        })
    }

    /// Load the metadata row, if present.
    pub fn find(conn: &Connection) -> PvResult<Option<Self>> {
        match conn.query_row(
            "SELECT last_modified, version FROM store_info WHERE id = ?1",
            [STORE_INFO_ID],
            Self::from_row,
        ) {
            Ok(info) => Ok(Some(info)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PvError::ReadFailed(e.to_string())),
        }
    }

    /// Insert the metadata row stamped with `now` unless one exists.
    /// Returns whether a row was created.
    pub fn ensure(conn: &Connection, now: i64) -> PvResult<bool> {
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO store_info (id, last_modified, version) VALUES (?1, ?2, ?3)",
                params![STORE_INFO_ID, now, STORE_FORMAT_VERSION],
            )
            .map_err(|e| PvError::Migration(e.to_string()))?;
        Ok(inserted > 0)
    }

    /// Set `last_modified` on the existing row.
    pub fn touch(conn: &Connection, stamp: i64) -> PvResult<()> {
        let changed = conn
            .execute(
                "UPDATE store_info SET last_modified = ?1 WHERE id = ?2",
                params![stamp, STORE_INFO_ID],
            )
            .map_err(|e| PvError::WriteFailed(e.to_string()))?;
        if changed == 0 {
            return Err(PvError::MetadataMissing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_ensure_only_inserts_once() {
        let conn = conn();
        assert!(StoreInfo::ensure(&conn, 10).unwrap());
        assert!(!StoreInfo::ensure(&conn, 20).unwrap());
        assert_eq!(StoreInfo::find(&conn).unwrap().unwrap().last_modified, 10);
    }

    #[test]
    fn test_touch_without_row_is_metadata_missing() {
        let conn = conn();
        assert!(StoreInfo::find(&conn).unwrap().is_none());
        assert!(matches!(StoreInfo::touch(&conn, 5), Err(PvError::MetadataMissing)));
    }

    #[test]
    fn test_touch_updates_timestamp() {
        let conn = conn();
        StoreInfo::ensure(&conn, 10).unwrap();
        StoreInfo::touch(&conn, 42).unwrap();
        assert_eq!(StoreInfo::find(&conn).unwrap().unwrap().last_modified, 42);
    }
}
