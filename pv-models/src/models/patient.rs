//! Patient entity model.

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use pv_core::error::{PvError, PvResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A patient record.
///
/// `id` is `None` until the record is first persisted and stable afterwards.
/// The medical record number is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub medical_record_number: String,
    pub notes: Option<String>,
}

impl Patient {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: NaiveDate,
        medical_record_number: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth,
            medical_record_number: medical_record_number.into(),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Construct a Patient from a database row.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let dob: String = row.get("date_of_birth")?;
        let date_of_birth = NaiveDate::parse_from_str(&dob, DATE_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get("id")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            date_of_birth,
            medical_record_number: row.get("medical_record_number")?,
            notes: row.get("notes")?,
        })
    }

    // ─── Validation ──────────────────────────────────────────────────────

    /// Check required fields and that the birth date is not after `today`.
    pub fn validate_on(&self, today: NaiveDate) -> PvResult<()> {
        if self.first_name.trim().is_empty() {
            return Err(PvError::ValidationFailed("first name is required".into()));
        }
        if self.last_name.trim().is_empty() {
            return Err(PvError::ValidationFailed("last name is required".into()));
        }
        if self.medical_record_number.trim().is_empty() {
            return Err(PvError::ValidationFailed("medical record number is required".into()));
        }
        if self.date_of_birth > today {
            return Err(PvError::ValidationFailed(format!(
                "date of birth {} is in the future",
                self.date_of_birth
            )));
        }
        Ok(())
    }

    // ─── Computed properties ─────────────────────────────────────────────

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Age in whole years on the given date.
    pub fn age_on(&self, date: NaiveDate) -> u32 {
        date.years_since(self.date_of_birth).unwrap_or(0)
    }

    /// Case-insensitive substring match over names and record number.
    /// An empty needle matches everything.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.first_name.to_lowercase().contains(&needle)
            || self.last_name.to_lowercase().contains(&needle)
            || self.medical_record_number.to_lowercase().contains(&needle)
    }

    // ─── Static finders ──────────────────────────────────────────────────

    pub fn find_by_id(conn: &Connection, id: i64) -> PvResult<Option<Self>> {
        match conn.query_row("SELECT * FROM patients WHERE id = ?1", [id], Self::from_row) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PvError::ReadFailed(e.to_string())),
        }
    }

    pub fn find_by_mrn(conn: &Connection, mrn: &str) -> PvResult<Option<Self>> {
        match conn.query_row(
            "SELECT * FROM patients WHERE medical_record_number = ?1",
            [mrn],
            Self::from_row,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PvError::ReadFailed(e.to_string())),
        }
    }

    /// All patients ordered by last name, then first name.
    pub fn load_all(conn: &Connection) -> PvResult<Vec<Self>> {
        let mut stmt = conn
            .prepare("SELECT * FROM patients ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, id")
            .map_err(|e| PvError::ReadFailed(e.to_string()))?;
        let rows = stmt
            .query_map([], Self::from_row)
            .map_err(|e| PvError::ReadFailed(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PvError::ReadFailed(e.to_string()))
    }

    pub fn count(conn: &Connection) -> PvResult<i64> {
        conn.query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))
            .map_err(|e| PvError::ReadFailed(e.to_string()))
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Insert a new record or update the existing one. Returns the id.
    pub fn save(&mut self, conn: &Connection) -> PvResult<i64> {
        let dob = self.date_of_birth.format(DATE_FORMAT).to_string();

        match self.id {
            Some(id) => {
                let changed = conn
                    .execute(
                        "UPDATE patients SET first_name = ?1, last_name = ?2, date_of_birth = ?3,
                            medical_record_number = ?4, notes = ?5
                         WHERE id = ?6",
                        params![
                            self.first_name,
                            self.last_name,
                            dob,
                            self.medical_record_number,
                            self.notes,
                            id
                        ],
                    )
                    .map_err(|e| PvError::WriteFailed(e.to_string()))?;
                if changed == 0 {
                    return Err(PvError::WriteFailed(format!("patient {id} does not exist")));
                }
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO patients (first_name, last_name, date_of_birth, medical_record_number, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        self.first_name,
                        self.last_name,
                        dob,
                        self.medical_record_number,
                        self.notes
                    ],
                )
                .map_err(|e| PvError::WriteFailed(e.to_string()))?;
                let id = conn.last_insert_rowid();
                self.id = Some(id);
                Ok(id)
            }
        }
    }

    /// Delete a patient by id. Returns whether a row was removed.
    pub fn delete(conn: &Connection, id: i64) -> PvResult<bool> {
        let changed = conn
            .execute("DELETE FROM patients WHERE id = ?1", [id])
            .map_err(|e| PvError::WriteFailed(e.to_string()))?;
        Ok(changed > 0)
    }
}

impl std::fmt::Display for Patient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.full_name(), self.medical_record_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::migrate(&conn, 1).unwrap();
        conn
    }

    #[test]
    fn test_insert_assigns_id_and_round_trips() {
        let conn = conn();
        let mut p = Patient::new("Ada", "Lovelace", date(1815, 12, 10), "MRN-1").with_notes("allergic to penicillin");
        let id = p.save(&conn).unwrap();
        assert_eq!(p.id, Some(id));

        let loaded = Patient::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(loaded, p);
    }

    #[test]
    fn test_update_keeps_id() {
        let conn = conn();
        let mut p = Patient::new("Alan", "Turing", date(1912, 6, 23), "MRN-2");
        let id = p.save(&conn).unwrap();
        p.notes = Some("follow-up".into());
        assert_eq!(p.save(&conn).unwrap(), id);
        assert_eq!(Patient::count(&conn).unwrap(), 1);
        assert_eq!(Patient::find_by_mrn(&conn, "MRN-2").unwrap().unwrap().notes.as_deref(), Some("follow-up"));
    }

    #[test]
    fn test_duplicate_mrn_is_write_failure() {
        let conn = conn();
        Patient::new("A", "One", date(1990, 1, 1), "DUP").save(&conn).unwrap();
        let err = Patient::new("B", "Two", date(1991, 1, 1), "DUP").save(&conn).unwrap_err();
        assert!(matches!(err, PvError::WriteFailed(_)));
    }

    #[test]
    fn test_update_missing_row_fails() {
        let conn = conn();
        let mut p = Patient::new("Ghost", "Row", date(2000, 1, 1), "MRN-X");
        p.id = Some(77);
        assert!(matches!(p.save(&conn), Err(PvError::WriteFailed(_))));
    }

    #[test]
    fn test_load_all_is_ordered_by_name() {
        let conn = conn();
        Patient::new("Zed", "Brown", date(1980, 1, 1), "1").save(&conn).unwrap();
        Patient::new("Amy", "Brown", date(1980, 1, 1), "2").save(&conn).unwrap();
        Patient::new("Bob", "adams", date(1980, 1, 1), "3").save(&conn).unwrap();

        let names: Vec<String> = Patient::load_all(&conn).unwrap().iter().map(Patient::full_name).collect();
        assert_eq!(names, vec!["Bob adams", "Amy Brown", "Zed Brown"]);
    }

    #[test]
    fn test_delete() {
        let conn = conn();
        let mut p = Patient::new("Del", "Me", date(1970, 5, 5), "DEL");
        let id = p.save(&conn).unwrap();
        assert!(Patient::delete(&conn, id).unwrap());
        assert!(!Patient::delete(&conn, id).unwrap());
        assert!(Patient::find_by_id(&conn, id).unwrap().is_none());
    }

    #[test]
    fn test_validation() {
        let today = date(2024, 1, 1);
        let ok = Patient::new("Ada", "Lovelace", date(1990, 1, 1), "M1");
        assert!(ok.validate_on(today).is_ok());

        let blank = Patient::new("  ", "Lovelace", date(1990, 1, 1), "M1");
        assert!(matches!(blank.validate_on(today), Err(PvError::ValidationFailed(_))));

        let no_mrn = Patient::new("Ada", "Lovelace", date(1990, 1, 1), "");
        assert!(matches!(no_mrn.validate_on(today), Err(PvError::ValidationFailed(_))));

        let future = Patient::new("Ada", "Lovelace", date(2030, 1, 1), "M1");
        assert!(matches!(future.validate_on(today), Err(PvError::ValidationFailed(_))));
    }

    #[test]
    fn test_age_and_matching() {
        let p = Patient::new("Grace", "Hopper", date(1906, 12, 9), "NAVY-42");
        assert_eq!(p.age_on(date(1906, 12, 9)), 0);
        assert_eq!(p.age_on(date(2006, 12, 8)), 99);
        assert_eq!(p.age_on(date(2006, 12, 9)), 100);
        assert!(p.matches("hop"));
        assert!(p.matches("GRA"));
        assert!(p.matches("navy"));
        assert!(p.matches(""));
        assert!(!p.matches("turing"));
    }
}
