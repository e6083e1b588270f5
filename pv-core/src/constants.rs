//! Application-wide constants.

/// Application name, also the per-user directory name.
pub const APP_NAME: &str = "PatientVault";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name of the primary store file.
pub const STORE_FILE_NAME: &str = "patients.sqlite";

/// Suffix SQLite appends for the write-ahead log side file.
pub const WAL_SUFFIX: &str = "-wal";

/// Suffix SQLite appends for the shared-memory index side file.
pub const SHM_SUFFIX: &str = "-shm";

/// Schema version applied by migrations.
pub const DB_SCHEMA_VERSION: i32 = 1;

/// Format tag stored in the metadata row.
pub const STORE_FORMAT_VERSION: &str = "1.0";

/// Fixed primary key of the metadata row.
pub const STORE_INFO_ID: i64 = 1;

/// Remote property carrying the snapshot's logical timestamp.
pub const LAST_MODIFIED_PROPERTY: &str = "lastModified";

/// MIME type of uploaded snapshots.
pub const SNAPSHOT_MIME_TYPE: &str = "application/x-sqlite3";

/// Remote folder that scopes blobs to this application.
pub const APP_DATA_FOLDER: &str = "appDataFolder";

/// Default seconds between pull cycles.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Default HTTP timeout in milliseconds.
pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;

/// Default URL whose `Date` header serves as trusted time.
pub const DEFAULT_TIME_SOURCE_URL: &str = "https://www.google.com";

/// First 16 bytes of every plaintext SQLite database file.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Capacity of the application event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;
