//! Whole-file store replacement.
//!
//! Swaps the live store for a candidate file (typically a snapshot downloaded
//! from another device) while the application keeps running:
//!
//! 1. Validate the candidate before touching anything: it must open with the
//!    store's key and carry the metadata row
//! 2. Take exclusive access to the pool slot and drop the pool
//! 3. Remove the `-wal` / `-shm` side files (best effort)
//! 4. Move the store file aside
//! 5. Copy the candidate to the canonical path
//! 6. Verify the copy landed
//! 7. Re-open, which re-runs the idempotent migration
//! 8. Verify the pool is live, then drop the moved-aside file
//!
//! If steps 5 to 8 fail, the previous file is moved back and re-opened.
//! No read or write is in flight between steps 2 and 8: operations hold the
//! shared guard for their full duration.

use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use pv_core::constants::{SHM_SUFFIX, SQLITE_HEADER, WAL_SUFFIX};
use pv_core::error::{PvError, PvResult};

use crate::db::{build_pool, configure_connection, DbPool, StoreConfig, StoreHandle};
use crate::models::store_info::StoreInfo;

/// Suffix of the previous store file while a replacement is in progress.
const PREVIOUS_SUFFIX: &str = "-previous";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Paths of the `-wal` and `-shm` files SQLite keeps next to `path`.
pub fn side_files(path: &Path) -> [PathBuf; 2] {
    [with_suffix(path, WAL_SUFFIX), with_suffix(path, SHM_SUFFIX)]
}

/// Remove the side files of `path`. Failures are logged, never returned.
pub fn remove_side_files(path: &Path) {
    for side in side_files(path) {
        match fs::remove_file(&side) {
            Ok(()) => debug!("removed {}", side.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", side.display()),
        }
    }
}

/// Check that `candidate` holds a store readable with `key` before anything
/// is torn down. An empty `key` means a plaintext store.
pub fn validate_candidate(candidate: &Path, key: &str) -> PvResult<()> {
    let invalid = |what: &dyn std::fmt::Display| {
        PvError::InvalidCandidate(format!("{}: {what}", candidate.display()))
    };

    let meta = fs::metadata(candidate).map_err(|e| invalid(&e))?;
    if !meta.is_file() {
        return Err(invalid(&"not a file"));
    }
    if meta.len() == 0 {
        return Err(invalid(&"empty"));
    }

    if key.is_empty() {
        let mut header = [0u8; 16];
        let mut file = fs::File::open(candidate).map_err(|e| invalid(&e))?;
        let complete = file.read_exact(&mut header).is_ok();
        if !complete || &header != SQLITE_HEADER {
            return Err(invalid(&"not a SQLite database"));
        }
    }

    let found = {
        let conn = Connection::open(candidate).map_err(|e| invalid(&e))?;
        configure_connection(&conn, key, false)
            .map_err(|e| invalid(&format!("does not open with the store key: {e}")))?;
        StoreInfo::find(&conn).map_err(|e| invalid(&e))?.is_some()
    };
    remove_side_files(candidate);

    if !found {
        return Err(invalid(&"no store metadata"));
    }
    Ok(())
}

/// Copy `candidate` over `path` and open it. On failure the caller restores
/// the previous file.
fn install(config: &StoreConfig, candidate: &Path, now: i64) -> PvResult<DbPool> {
    let path = &config.path;
    fs::copy(candidate, path).map_err(|e| {
        PvError::ReplaceFailed(format!(
            "cannot copy {} to {}: {e}",
            candidate.display(),
            path.display()
        ))
    })?;

    if !path.is_file() {
        return Err(PvError::ReplaceFailed(format!("{} missing after copy", path.display())));
    }

    let pool = build_pool(config, now)?;
    pool.get().map_err(|e| {
        PvError::StoreUnavailable(format!("store pool not live after replacement: {e}"))
    })?;
    Ok(pool)
}

/// Put the moved-aside file back at `path` and re-open it.
fn restore_previous(config: &StoreConfig, previous: &Path, now: i64) -> PvResult<DbPool> {
    let path = &config.path;
    remove_side_files(path);
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {e}", path.display());
        }
    }
    fs::rename(previous, path).map_err(|e| {
        PvError::ReplaceFailed(format!("cannot restore {}: {e}", previous.display()))
    })?;
    build_pool(config, now)
}

impl StoreHandle {
    /// Replace the whole store with the file at `candidate`.
    ///
    /// An invalid candidate leaves the current store untouched. File-system
    /// failures during the swap surface as `ReplaceFailed`; a store that will
    /// not re-open afterwards leaves the handle closed with `StoreUnavailable`.
    /// The candidate itself is copied, never moved.
    pub fn replace_with(&self, candidate: &Path) -> PvResult<()> {
        let config = self.config();
        validate_candidate(candidate, config.encryption.active_key())?;

        let path = config.path.clone();
        let previous = with_suffix(&path, PREVIOUS_SUFFIX);
        info!("replacing store at {} with {}", path.display(), candidate.display());

        let mut slot = self.slot_write();
        if let Some(pool) = slot.take() {
            drop(pool);
            debug!("released store pool for replacement");
        }

        remove_side_files(&path);

        let had_previous = path.exists();
        if had_previous {
            if previous.exists() {
                fs::remove_file(&previous).map_err(|e| {
                    PvError::ReplaceFailed(format!("cannot remove {}: {e}", previous.display()))
                })?;
            }
            fs::rename(&path, &previous).map_err(|e| {
                PvError::ReplaceFailed(format!("cannot move {} aside: {e}", path.display()))
            })?;
        }

        let now = self.now();
        match install(&config, candidate, now) {
            Ok(pool) => {
                *slot = Some(pool);
                if had_previous {
                    if let Err(e) = fs::remove_file(&previous) {
                        warn!("failed to remove {}: {e}", previous.display());
                    }
                }
                info!("store replaced from {}", candidate.display());
                Ok(())
            }
            Err(e) if had_previous => {
                error!("replacement failed, restoring previous store: {e}");
                match restore_previous(&config, &previous, now) {
                    Ok(pool) => *slot = Some(pool),
                    Err(restore) => error!("previous store did not re-open: {restore}"),
                }
                Err(e)
            }
            Err(e) => {
                error!("store did not re-open after replacement: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use pv_core::clock::ManualClock;
    use tempfile::TempDir;

    use crate::db::{EncryptionConfig, StoreConfig};
    use crate::models::patient::Patient;

    fn open(path: &Path, now: i64) -> StoreHandle {
        StoreHandle::open_with(StoreConfig::new(path), Arc::new(ManualClock::new(now))).unwrap()
    }

    fn open_encrypted(path: &Path, key: &str, now: i64) -> StoreHandle {
        StoreHandle::open_with(
            StoreConfig::new(path).with_encryption(EncryptionConfig::with_key(key)),
            Arc::new(ManualClock::new(now)),
        )
        .unwrap()
    }

    fn add(store: &StoreHandle, mrn: &str) {
        let dob = NaiveDate::from_ymd_opt(1975, 7, 1).unwrap();
        store.write(|conn| Patient::new("R", mrn, dob, mrn).save(conn)).unwrap();
    }

    fn mrns(store: &StoreHandle) -> Vec<String> {
        store
            .read(|conn| Patient::load_all(conn))
            .unwrap()
            .into_iter()
            .map(|p| p.medical_record_number)
            .collect()
    }

    #[test]
    fn test_side_files() {
        let [wal, shm] = side_files(Path::new("/tmp/x/patients.sqlite"));
        assert_eq!(wal, PathBuf::from("/tmp/x/patients.sqlite-wal"));
        assert_eq!(shm, PathBuf::from("/tmp/x/patients.sqlite-shm"));
    }

    #[test]
    fn test_replace_installs_candidate_records() {
        let dir = TempDir::new().unwrap();

        let other = open(&dir.path().join("other.sqlite"), 200);
        add(&other, "REMOTE-1");
        add(&other, "REMOTE-2");
        let candidate = dir.path().join("candidate.sqlite");
        other.export_snapshot(&candidate).unwrap();

        let store = open(&dir.path().join("local.sqlite"), 100);
        add(&store, "LOCAL-1");

        store.replace_with(&candidate).unwrap();

        assert!(store.is_open());
        assert_eq!(mrns(&store), vec!["REMOTE-1", "REMOTE-2"]);
        assert_eq!(store.current_timestamp().unwrap(), 200);
        assert!(candidate.exists(), "candidate must be copied, not moved");

        // Writes keep working on the new file.
        add(&store, "LOCAL-2");
        assert_eq!(mrns(&store).len(), 3);
    }

    #[test]
    fn test_empty_candidate_is_rejected_and_store_untouched() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir.path().join("local.sqlite"), 100);
        add(&store, "KEEP");

        let empty = dir.path().join("empty.sqlite");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(store.replace_with(&empty), Err(PvError::InvalidCandidate(_))));

        let missing = dir.path().join("missing.sqlite");
        assert!(matches!(store.replace_with(&missing), Err(PvError::InvalidCandidate(_))));

        assert!(store.is_open());
        assert_eq!(mrns(&store), vec!["KEEP"]);
    }

    #[test]
    fn test_non_sqlite_candidate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir.path().join("local.sqlite"), 100);

        let junk = dir.path().join("junk.sqlite");
        fs::write(&junk, b"definitely not a database file").unwrap();
        assert!(matches!(store.replace_with(&junk), Err(PvError::InvalidCandidate(_))));
        assert!(store.is_open());
    }

    #[test]
    fn test_replace_with_own_export_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir.path().join("local.sqlite"), 300);
        add(&store, "A");
        add(&store, "B");
        let before = mrns(&store);
        let stamp = store.current_timestamp().unwrap();

        let snapshot = dir.path().join("snap.sqlite");
        store.export_snapshot(&snapshot).unwrap();
        store.replace_with(&snapshot).unwrap();

        assert_eq!(mrns(&store), before);
        assert_eq!(store.current_timestamp().unwrap(), stamp);
    }

    #[test]
    fn test_encrypted_store_rejects_junk_candidate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.sqlite");
        let store = open_encrypted(&path, "k", 100);
        add(&store, "KEEP");

        let junk = dir.path().join("junk.sqlite");
        fs::write(&junk, b"definitely not a database file").unwrap();
        assert!(matches!(store.replace_with(&junk), Err(PvError::InvalidCandidate(_))));

        assert!(store.is_open());
        assert_eq!(mrns(&store), vec!["KEEP"]);
        assert_ne!(fs::read(&path).unwrap(), b"definitely not a database file");
    }

    #[test]
    fn test_encrypted_store_rejects_snapshot_with_other_key() {
        let dir = TempDir::new().unwrap();
        let foreign = open_encrypted(&dir.path().join("foreign.sqlite"), "other", 500);
        add(&foreign, "FOREIGN");
        let candidate = dir.path().join("candidate.sqlite");
        foreign.export_snapshot(&candidate).unwrap();

        let store = open_encrypted(&dir.path().join("local.sqlite"), "k", 100);
        add(&store, "KEEP");

        assert!(matches!(store.replace_with(&candidate), Err(PvError::InvalidCandidate(_))));
        assert_eq!(mrns(&store), vec!["KEEP"]);
        assert_eq!(store.current_timestamp().unwrap(), 100);
    }

    #[test]
    fn test_encrypted_store_accepts_snapshot_with_same_key() {
        let dir = TempDir::new().unwrap();
        let other = open_encrypted(&dir.path().join("other.sqlite"), "k", 500);
        add(&other, "REMOTE");
        let candidate = dir.path().join("candidate.sqlite");
        other.export_snapshot(&candidate).unwrap();

        let store = open_encrypted(&dir.path().join("local.sqlite"), "k", 100);
        add(&store, "LOCAL");

        store.replace_with(&candidate).unwrap();
        assert_eq!(mrns(&store), vec!["REMOTE"]);
        assert_eq!(store.current_timestamp().unwrap(), 500);
        assert!(!with_suffix(&dir.path().join("local.sqlite"), PREVIOUS_SUFFIX).exists());
    }

    #[test]
    fn test_candidate_without_metadata_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bare = dir.path().join("bare.sqlite");
        {
            let conn = Connection::open(&bare).unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);").unwrap();
        }

        let store = open(&dir.path().join("local.sqlite"), 100);
        add(&store, "KEEP");
        assert!(matches!(store.replace_with(&bare), Err(PvError::InvalidCandidate(_))));
        assert_eq!(mrns(&store), vec!["KEEP"]);
    }

    #[test]
    fn test_restore_previous_reopens_moved_aside_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.sqlite");
        let store = open(&path, 100);
        add(&store, "KEEP");
        let config = store.config();
        store.close();

        let previous = with_suffix(&path, PREVIOUS_SUFFIX);
        fs::rename(&path, &previous).unwrap();
        fs::write(&path, b"half-copied garbage").unwrap();

        let pool = restore_previous(&config, &previous, 100).unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(Patient::load_all(&conn).unwrap().len(), 1);
        assert!(!previous.exists());
    }
}
