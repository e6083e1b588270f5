//! Switching the store between plaintext and encrypted.
//!
//! The running store is exported under the target configuration to a staging
//! file next to it, the staging file is opened under that configuration and
//! its patient count compared with the original, and only then is it renamed
//! over the store. Until the rename, the original file and settings stay in
//! effect.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{error, info, warn};

use pv_core::error::{PvError, PvResult};

use crate::db::{build_pool, configure_connection, export_database, not_open, EncryptionConfig, StoreHandle};
use crate::models::patient::Patient;
use crate::replace::remove_side_files;

impl StoreHandle {
    /// Flip encryption at rest and re-open. Returns the new enabled flag.
    ///
    /// Enabling requires key material in the store configuration.
    pub fn toggle_encryption(&self) -> PvResult<bool> {
        let current = self.config();
        let target_encryption = current.encryption.toggled()?;
        let staging = staging_path(&current.path);

        let mut slot = self.slot_write();
        let pool = slot.as_ref().ok_or_else(not_open)?;

        let expected = {
            let conn = pool.get().map_err(|e| PvError::Pool(e.to_string()))?;
            let expected = Patient::count(&conn)?;
            export_database(&conn, &staging, target_encryption.active_key())?;
            expected
        };

        if let Err(e) = verify_export(&staging, &target_encryption, expected) {
            error!("re-encrypted export failed validation: {e}");
            discard(&staging);
            return Err(e);
        }

        drop(slot.take());
        remove_side_files(&current.path);
        if let Err(e) = fs::rename(&staging, &current.path) {
            discard(&staging);
            // The original file is still in place; bring it back.
            *slot = Some(build_pool(&current, self.now())?);
            return Err(PvError::ReplaceFailed(format!(
                "cannot install re-encrypted store: {e}"
            )));
        }

        let mut target = current;
        target.encryption = target_encryption;
        self.set_config(target.clone());
        *slot = Some(build_pool(&target, self.now())?);

        info!(
            "store encryption {}",
            if target.encryption.enabled { "enabled" } else { "disabled" }
        );
        Ok(target.encryption.enabled)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    path.with_file_name(format!(".{name}.{}.reencrypt", uuid::Uuid::new_v4()))
}

fn verify_export(path: &Path, encryption: &EncryptionConfig, expected: i64) -> PvResult<()> {
    let conn = Connection::open(path).map_err(|e| PvError::Migration(e.to_string()))?;
    configure_connection(&conn, encryption.active_key(), false)
        .map_err(|e| PvError::Migration(format!("export does not open: {e}")))?;
    let found = Patient::count(&conn)?;
    if found != expected {
        return Err(PvError::Migration(format!(
            "export has {found} patients, expected {expected}"
        )));
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove staging file {}: {e}", path.display());
        }
    }
    remove_side_files(path);
}
