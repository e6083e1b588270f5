//! Local store handle: opening, connection pooling, stamped writes, and
//! snapshot export.
//!
//! Uses SQLite (SQLCipher when a key is configured) in WAL mode with r2d2
//! connection pooling. The handle owns the only pool on the store file. Every
//! operation holds a shared guard on the pool slot for its whole duration;
//! swapping the file (replacement, re-encryption) takes the exclusive guard.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, error, info, warn};

use pv_core::clock::Clock;
use pv_core::config::AppConfig;
use pv_core::constants::STORE_FILE_NAME;
use pv_core::error::{PvError, PvResult};

use crate::migrations;
use crate::models::patient::Patient;
use crate::models::store_info::StoreInfo;
use crate::replace::{remove_side_files, side_files};

/// Type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Encryption settings for the store file.
///
/// The key is kept even while encryption is disabled so the store can be
/// re-encrypted later without asking for it again.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub enabled: bool,
    key: String,
}

impl EncryptionConfig {
    /// Plaintext store, no key available.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Encrypted store using `key`.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { enabled: true, key: key.into() }
    }

    /// Plaintext store with a key held for a later toggle.
    pub fn dormant(key: impl Into<String>) -> Self {
        Self { enabled: false, key: key.into() }
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Key applied to connections; empty when encryption is off.
    pub fn active_key(&self) -> &str {
        if self.enabled {
            &self.key
        } else {
            ""
        }
    }

    /// The same key material with the flag flipped.
    pub fn toggled(&self) -> PvResult<Self> {
        if !self.enabled && !self.has_key() {
            return Err(PvError::Config("cannot enable encryption without a key".into()));
        }
        Ok(Self { enabled: !self.enabled, key: self.key.clone() })
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key", &if self.has_key() { "<redacted>" } else { "<none>" })
            .finish()
    }
}

/// Everything needed to open the store file.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub encryption: EncryptionConfig,
    pub wal_mode: bool,
    pub pool_size: u32,
    pub connection_timeout: Duration,
    pub integrity_check_on_open: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            encryption: EncryptionConfig::disabled(),
            wal_mode: true,
            pool_size: 4,
            connection_timeout: Duration::from_secs(10),
            integrity_check_on_open: false,
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    /// Build from the `[database]` section, resolving the default location
    /// and environment key overrides.
    pub fn from_app_config(config: &AppConfig) -> PvResult<Self> {
        let db = &config.database;
        // Fails early when encryption is on but no key is available.
        db.effective_key()?;
        let key = db.key_material().unwrap_or_default();

        Ok(Self {
            path: config.effective_db_path()?,
            encryption: EncryptionConfig { enabled: db.encrypted, key },
            wal_mode: db.wal_mode,
            pool_size: db.pool_size.max(1),
            connection_timeout: Duration::from_secs(db.connection_timeout_secs.max(1)),
            integrity_check_on_open: db.integrity_check_on_startup,
        })
    }
}

/// Handle to the local store. Clones share the same pool slot.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: RwLock<StoreConfig>,
    slot: RwLock<Option<DbPool>>,
    clock: Arc<dyn Clock>,
}

impl StoreHandle {
    /// Create a closed handle. Call [`StoreHandle::open`] before use.
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: RwLock::new(config),
                slot: RwLock::new(None),
                clock,
            }),
        }
    }

    /// Create and open a handle in one step.
    pub fn open_with(config: StoreConfig, clock: Arc<dyn Clock>) -> PvResult<Self> {
        let handle = Self::new(config, clock);
        handle.open()?;
        Ok(handle)
    }

    /// Open the store file, creating and migrating it if needed.
    ///
    /// This:
    /// 1. Creates the parent directory
    /// 2. Applies the encryption key and verifies it by reading the schema
    /// 3. Enables WAL mode and performance pragmas
    /// 4. Runs the integrity check if configured
    /// 5. Runs migrations and seeds the metadata row
    /// 6. Builds the connection pool
    ///
    /// Any failure leaves the handle closed and returns `StoreUnavailable`.
    /// Opening an already open handle is a no-op.
    pub fn open(&self) -> PvResult<()> {
        let config = self.config();
        let mut slot = self.slot_write();
        if slot.is_some() {
            debug!("store already open at {}", config.path.display());
            return Ok(());
        }

        let pool = build_pool(&config, self.inner.clock.now()).map_err(|e| {
            error!("failed to open store at {}: {e}", config.path.display());
            e
        })?;
        *slot = Some(pool);
        info!("store opened at {}", config.path.display());
        Ok(())
    }

    /// Release the pool. Later operations fail with `StoreUnavailable`.
    pub fn close(&self) {
        let mut slot = self.slot_write();
        if slot.take().is_some() {
            info!("store closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot_read().is_some()
    }

    /// Canonical path of the store file.
    pub fn path(&self) -> PathBuf {
        self.config().path
    }

    pub fn is_encrypted(&self) -> bool {
        self.config().encryption.enabled
    }

    /// Snapshot of the current open settings.
    pub fn config(&self) -> StoreConfig {
        self.inner.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Run `mutation` in an immediate transaction and bump the store
    /// timestamp in the same commit. Returns the mutation's value.
    pub fn write<T, F>(&self, mutation: F) -> PvResult<T>
    where
        F: FnOnce(&Connection) -> PvResult<T>,
    {
        self.write_stamped(mutation).map(|(value, _)| value)
    }

    /// Like [`StoreHandle::write`], also returning the stamp written.
    ///
    /// The stamp is `max(clock, current last_modified)`, so timestamps never
    /// move backwards on this device. Nothing is committed on error.
    pub fn write_stamped<T, F>(&self, mutation: F) -> PvResult<(T, i64)>
    where
        F: FnOnce(&Connection) -> PvResult<T>,
    {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| PvError::WriteFailed(e.to_string()))?;

            let previous = StoreInfo::find(&tx)
                .map_err(as_write_failure)?
                .ok_or(PvError::MetadataMissing)?;
            let stamp = self.inner.clock.now().max(previous.last_modified);

            let value = mutation(&tx).map_err(as_write_failure)?;
            StoreInfo::touch(&tx, stamp)?;

            tx.commit().map_err(|e| PvError::WriteFailed(e.to_string()))?;
            debug!("write committed, last_modified={stamp}");
            Ok((value, stamp))
        })
    }

    /// Run `query` against a consistent read snapshot.
    pub fn read<T, F>(&self, query: F) -> PvResult<T>
    where
        F: FnOnce(&Connection) -> PvResult<T>,
    {
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| PvError::ReadFailed(e.to_string()))?;
            let value = query(&tx)?;
            Ok(value)
        })
    }

    /// The store's logical last-modified timestamp.
    pub fn current_timestamp(&self) -> PvResult<i64> {
        self.read(|conn| {
            StoreInfo::find(conn)?
                .map(|info| info.last_modified)
                .ok_or(PvError::MetadataMissing)
        })
    }

    /// Write a self-contained copy of the store to `dest`.
    ///
    /// The copy has the WAL merged in, no side files, and the same
    /// encryption as the live store. An existing file at `dest` is replaced.
    pub fn export_snapshot(&self, dest: &Path) -> PvResult<()> {
        let key = self.config().encryption.active_key().to_string();
        self.with_conn(|conn| export_database(conn, dest, &key))?;
        info!("exported store snapshot to {}", dest.display());
        Ok(())
    }

    /// Export a snapshot and return the timestamp of its content.
    ///
    /// The timestamp is read on both sides of the export; if a write slipped
    /// in between, the export is retried so the returned stamp matches what
    /// is in the file.
    pub fn export_snapshot_stamped(&self, dest: &Path) -> PvResult<i64> {
        const ATTEMPTS: usize = 3;
        let mut stamp = self.current_timestamp()?;
        for attempt in 1..=ATTEMPTS {
            self.export_snapshot(dest)?;
            let after = self.current_timestamp()?;
            if after == stamp {
                return Ok(stamp);
            }
            if attempt == ATTEMPTS {
                // Content is at least as new as `stamp`; never claim more.
                warn!("store kept changing during export; stamping snapshot with {stamp}");
                break;
            }
            debug!("store changed during export (attempt {attempt}), retrying");
            stamp = after;
        }
        Ok(stamp)
    }

    /// Export `patients.sqlite` into a user-visible directory.
    pub fn export_to_documents(&self, export_dir: &Path) -> PvResult<PathBuf> {
        let dest = export_dir.join(STORE_FILE_NAME);
        self.export_snapshot(&dest)?;
        Ok(dest)
    }

    /// Run a SQLite integrity check on the open store.
    pub fn integrity_check(&self) -> PvResult<()> {
        self.with_conn(|conn| run_integrity_check(conn))
    }

    /// Row counts, timestamp and on-disk sizes.
    pub fn stats(&self) -> PvResult<StoreStats> {
        let config = self.config();
        let (patients, last_modified, journal_mode, schema_version) = self.read(|conn| {
            let patients = Patient::count(conn)?;
            let last_modified = StoreInfo::find(conn)?.map(|i| i.last_modified);
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(|e| PvError::ReadFailed(e.to_string()))?;
            let schema_version = migrations::get_schema_version(conn)?;
            Ok((patients, last_modified, journal_mode, schema_version))
        })?;

        let size_of = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        let [wal, shm] = side_files(&config.path);

        Ok(StoreStats {
            path: config.path.clone(),
            encrypted: config.encryption.enabled,
            patients,
            last_modified,
            journal_mode,
            schema_version,
            file_size: size_of(&config.path),
            wal_size: size_of(&wal),
            shm_size: size_of(&shm),
        })
    }

    // ─── Slot access shared with the replacement and re-encryption paths ──

    pub(crate) fn slot_read(&self) -> RwLockReadGuard<'_, Option<DbPool>> {
        self.inner.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn slot_write(&self) -> RwLockWriteGuard<'_, Option<DbPool>> {
        self.inner.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_config(&self, config: StoreConfig) {
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub(crate) fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> PvResult<T>) -> PvResult<T> {
        let slot = self.slot_read();
        let pool = slot.as_ref().ok_or_else(not_open)?;
        let mut conn = pool.get().map_err(|e| PvError::Pool(e.to_string()))?;
        f(&mut conn)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("config", &self.config())
            .field("open", &self.is_open())
            .finish()
    }
}

pub(crate) fn not_open() -> PvError {
    PvError::StoreUnavailable("store is not open".into())
}

fn as_write_failure(e: PvError) -> PvError {
    match e {
        PvError::ReadFailed(msg) => PvError::WriteFailed(msg),
        other => other,
    }
}

/// Store statistics for diagnostics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub path: PathBuf,
    pub encrypted: bool,
    pub patients: i64,
    pub last_modified: Option<i64>,
    pub journal_mode: String,
    pub schema_version: i32,
    pub file_size: u64,
    pub wal_size: u64,
    pub shm_size: u64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "patients={}, last_modified={}, encrypted={}, journal={}, size={}B (wal={}B, shm={}B)",
            self.patients,
            self.last_modified.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
            self.encrypted,
            self.journal_mode,
            self.file_size,
            self.wal_size,
            self.shm_size
        )
    }
}

/// Open, verify and migrate the file, then build a pool on it.
pub(crate) fn build_pool(config: &StoreConfig, now: i64) -> PvResult<DbPool> {
    let unavailable = |what: &str, e: &dyn std::fmt::Display| {
        PvError::StoreUnavailable(format!("{what} {}: {e}", config.path.display()))
    };

    if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| unavailable("cannot create directory for", &e))?;
    }

    debug!(
        "opening store file {} (encrypted={})",
        config.path.display(),
        config.encryption.enabled
    );

    {
        let conn = Connection::open(&config.path).map_err(|e| unavailable("cannot open", &e))?;
        configure_connection(&conn, config.encryption.active_key(), config.wal_mode)
            .map_err(|e| unavailable("cannot read (wrong key or not a database)", &e))?;
        if config.integrity_check_on_open {
            run_integrity_check(&conn).map_err(|e| unavailable("integrity check failed for", &e))?;
        }
        migrations::migrate(&conn, now).map_err(|e| unavailable("cannot migrate", &e))?;
    }

    let manager = SqliteConnectionManager::file(&config.path);
    Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.connection_timeout)
        .connection_customizer(Box::new(ConnectionCustomizer {
            key: config.encryption.active_key().to_string(),
            wal_mode: config.wal_mode,
        }))
        .build(manager)
        .map_err(|e| unavailable("cannot build pool for", &e))
}

/// Apply the key, check it, then set journal and performance pragmas.
///
/// The key must be the first statement on a SQLCipher connection; a wrong key
/// only surfaces on the first read, hence the `sqlite_master` query.
pub(crate) fn configure_connection(conn: &Connection, key: &str, wal_mode: bool) -> rusqlite::Result<()> {
    if !key.is_empty() {
        conn.pragma_update(None, "key", key)?;
    }
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

    if wal_mode {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    }

    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA cache_size=-16000;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )
}

fn run_integrity_check(conn: &Connection) -> PvResult<()> {
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| PvError::ReadFailed(e.to_string()))?;

    if result != "ok" {
        error!("store integrity check failed: {result}");
        return Err(PvError::IntegrityCheck(result));
    }

    debug!("store integrity check passed");
    Ok(())
}

/// Copy the main database of `conn` into a fresh file at `dest`, encrypted
/// with `key` (plaintext when empty).
pub(crate) fn export_database(conn: &Connection, dest: &Path, key: &str) -> PvResult<()> {
    let failed = |e: rusqlite::Error| PvError::ReadFailed(format!("snapshot export failed: {e}"));

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        std::fs::remove_file(dest)?;
    }
    remove_side_files(dest);

    conn.execute(
        "ATTACH DATABASE ?1 AS snapshot KEY ?2",
        params![dest.to_string_lossy(), key],
    )
    .map_err(failed)?;

    let exported = conn
        .query_row("SELECT sqlcipher_export('snapshot')", [], |_| Ok(()))
        .and_then(|_| conn.execute_batch("PRAGMA snapshot.journal_mode=DELETE;"));
    let detached = conn.execute_batch("DETACH DATABASE snapshot");

    exported.map_err(failed)?;
    if let Err(e) = detached {
        warn!("failed to detach snapshot database: {e}");
    }
    Ok(())
}

/// r2d2 connection customizer that applies the key and PRAGMA settings.
struct ConnectionCustomizer {
    key: String,
    wal_mode: bool,
}

impl std::fmt::Debug for ConnectionCustomizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCustomizer")
            .field("encrypted", &!self.key.is_empty())
            .field("wal_mode", &self.wal_mode)
            .finish()
    }
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        configure_connection(conn, &self.key, self.wal_mode)
    }
}
