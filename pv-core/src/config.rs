//! Application configuration management.
//!
//! Handles loading, saving, and accessing application configuration: where
//! the store lives and how it is encrypted, how often it syncs, and which
//! remote backend holds the shared snapshot. Configuration is persisted as
//! TOML on disk. Secrets can be supplied through environment variables so
//! they never need to be written to the config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{PvError, PvResult};
use crate::platform::Platform;

/// Environment variable overriding `database.encryption_key`.
pub const ENV_ENCRYPTION_KEY: &str = "PV_DB_ENCRYPTION_KEY";

/// Environment variable overriding `remote.access_token`.
pub const ENV_ACCESS_TOKEN: &str = "PV_DRIVE_ACCESS_TOKEN";

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sync scheduling and conflict settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Remote blob store settings.
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Local store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the store file. If empty, uses the platform data directory.
    #[serde(default)]
    pub path: String,

    /// Enable WAL (Write-Ahead Logging) mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds to wait for a pooled connection before giving up.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Run integrity check on open.
    #[serde(default)]
    pub integrity_check_on_startup: bool,

    /// Encrypt the store at rest with SQLCipher.
    #[serde(default)]
    pub encrypted: bool,

    /// Passphrase used when `encrypted` is set. Prefer the
    /// `PV_DB_ENCRYPTION_KEY` environment variable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_key: String,

    /// Directory that receives user-visible exports. If empty, uses the
    /// platform documents directory.
    #[serde(default)]
    pub export_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (or a full filter directive).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output for the file layer.
    #[serde(default)]
    pub json_output: bool,
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Start the periodic pull cycle automatically.
    #[serde(default)]
    pub auto_sync: bool,

    /// Seconds between pull cycles.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Name of the canonical remote snapshot blob.
    #[serde(default = "default_blob_name")]
    pub blob_name: String,

    /// MIME type recorded on uploaded snapshots.
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Recalibrate the clock offset against `time_source_url` every cycle.
    #[serde(default = "default_true")]
    pub calibrate_clock: bool,

    /// URL whose HTTP `Date` header is used as trusted time.
    #[serde(default = "default_time_source_url")]
    pub time_source_url: String,
}

/// Which remote backend holds the shared snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// Google Drive application data folder.
    Drive,
    /// A plain directory, typically one mirrored by another sync tool.
    Folder,
}

/// Remote blob store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Backend selection.
    #[serde(default = "default_backend")]
    pub backend: RemoteBackend,

    /// Directory used by the folder backend.
    #[serde(default)]
    pub folder_path: String,

    /// OAuth bearer token for the Drive backend. Prefer the
    /// `PV_DRIVE_ACCESS_TOKEN` environment variable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,

    /// Drive metadata API root.
    #[serde(default = "default_drive_api_root")]
    pub api_root: String,

    /// Drive upload API root.
    #[serde(default = "default_drive_upload_root")]
    pub upload_root: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_api_timeout")]
    pub timeout_ms: u64,
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    4
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sync_interval() -> u64 {
    constants::DEFAULT_SYNC_INTERVAL_SECS
}

fn default_blob_name() -> String {
    constants::STORE_FILE_NAME.to_string()
}

fn default_mime_type() -> String {
    constants::SNAPSHOT_MIME_TYPE.to_string()
}

fn default_time_source_url() -> String {
    constants::DEFAULT_TIME_SOURCE_URL.to_string()
}

fn default_backend() -> RemoteBackend {
    RemoteBackend::Drive
}

fn default_drive_api_root() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_drive_upload_root() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_api_timeout() -> u64 {
    constants::DEFAULT_API_TIMEOUT_MS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            wal_mode: true,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            integrity_check_on_startup: false,
            encrypted: false,
            encryption_key: String::new(),
            export_dir: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: false,
            interval_secs: default_sync_interval(),
            blob_name: default_blob_name(),
            mime_type: default_mime_type(),
            calibrate_clock: true,
            time_source_url: default_time_source_url(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            folder_path: String::new(),
            access_token: String::new(),
            api_root: default_drive_api_root(),
            upload_root: default_drive_upload_root(),
            timeout_ms: default_api_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// The effective encryption key: environment first, then the config file.
    ///
    /// Returns `None` when encryption is disabled.
    pub fn effective_key(&self) -> PvResult<Option<String>> {
        if !self.encrypted {
            return Ok(None);
        }
        match self.key_material() {
            Some(key) => Ok(Some(key)),
            None => Err(PvError::Config(format!(
                "encryption is enabled but no key is configured (set {ENV_ENCRYPTION_KEY})"
            ))),
        }
    }

    /// The configured key regardless of whether encryption is enabled.
    /// Needed to turn encryption on for a store that is currently plaintext.
    pub fn key_material(&self) -> Option<String> {
        std::env::var(ENV_ENCRYPTION_KEY)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| Some(self.encryption_key.clone()).filter(|k| !k.is_empty()))
    }
}

impl RemoteConfig {
    /// The effective Drive access token: environment first, then the config file.
    pub fn effective_access_token(&self) -> Option<String> {
        std::env::var(ENV_ACCESS_TOKEN)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| Some(self.access_token.clone()).filter(|t| !t.is_empty()))
    }
}

impl AppConfig {
    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> PvResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> PvResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| PvError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values that would make the store or scheduler unusable.
    pub fn validate(&self) -> PvResult<()> {
        if self.database.pool_size == 0 {
            return Err(PvError::Config("database.pool_size must be at least 1".into()));
        }
        if self.sync.interval_secs == 0 {
            return Err(PvError::Config("sync.interval_secs must be at least 1".into()));
        }
        if self.sync.blob_name.trim().is_empty() {
            return Err(PvError::Config("sync.blob_name must not be empty".into()));
        }
        if self.remote.backend == RemoteBackend::Folder && self.remote.folder_path.is_empty() {
            return Err(PvError::Config(
                "remote.folder_path is required for the folder backend".into(),
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PvResult<PathBuf> {
        Ok(Platform::config_dir()?.join("config.toml"))
    }

    /// Get the effective store path, using the configured path or the default.
    pub fn effective_db_path(&self) -> PvResult<PathBuf> {
        if self.database.path.is_empty() {
            Ok(Platform::data_dir()?.join(constants::STORE_FILE_NAME))
        } else {
            Ok(PathBuf::from(&self.database.path))
        }
    }

    /// Get the effective export directory.
    pub fn effective_export_dir(&self) -> PvResult<PathBuf> {
        if self.database.export_dir.is_empty() {
            Platform::documents_dir()
        } else {
            Ok(PathBuf::from(&self.database.export_dir))
        }
    }

    /// Get the effective log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> PvResult<PathBuf> {
        if self.logging.directory.is_empty() {
            Ok(Platform::data_dir()?.join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }
}

/// Thread-safe configuration holder for shared access across services.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<AppConfig>>,
}

impl ConfigHandle {
    /// Create a new configuration handle.
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Read the configuration.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, AppConfig> {
        self.inner.read().await
    }

    /// Write/update the configuration.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, AppConfig> {
        self.inner.write().await
    }

    /// Clone the current configuration out of the lock.
    pub async fn snapshot(&self) -> AppConfig {
        self.inner.read().await.clone()
    }

    /// Save the current configuration to a specific file.
    pub async fn save_to(&self, path: &Path) -> PvResult<()> {
        let config = self.inner.read().await;
        config.save_to_file(path)
    }
}
