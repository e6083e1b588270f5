//! Global error types for Patient Vault.
//!
//! All error categories across the store, sync, and remote layers are unified
//! into a single `PvError` enum with conversions from underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using PvError.
pub type PvResult<T> = Result<T, PvError>;

/// Unified error type covering all error categories in Patient Vault.
#[derive(Error, Debug)]
pub enum PvError {
    // -- Configuration errors --
    /// Failed to load or parse application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // -- Local store errors --
    /// No open store handle: setup failed, the store was closed, or a
    /// replacement could not re-open it.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The metadata row is absent after migration. Treated as corruption.
    #[error("store metadata row is missing")]
    MetadataMissing,

    /// A mutation or its timestamp bump failed; nothing was committed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read query failed in the storage engine.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Database integrity check failed.
    #[error("database integrity check failed: {0}")]
    IntegrityCheck(String),

    // -- Record errors --
    /// Caller-supplied record is invalid; the store was not touched.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    // -- Replacement protocol errors --
    /// Candidate file is missing, empty, or not a database.
    #[error("invalid replacement candidate: {0}")]
    InvalidCandidate(String),

    /// A file-system step of the replacement protocol failed.
    #[error("store replacement failed: {0}")]
    ReplaceFailed(String),

    // -- Remote errors --
    /// Listing failed or the canonical blob could not be found.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote blob properties are missing or unparsable.
    #[error("invalid remote metadata: {0}")]
    InvalidMetadata(String),

    /// Downloading the remote snapshot failed.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// HTTP transport or protocol error.
    #[error("http error: {0}")]
    Http(String),

    // -- Sync errors --
    /// Another sync cycle or push holds the guard.
    #[error("sync already in progress")]
    SyncInProgress,

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PvError {
    /// Whether this error means the store handle is not usable right now.
    ///
    /// Callers disable mutating actions until the store comes back.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PvError::StoreUnavailable(_))
    }

    /// Whether this error originated on the remote side of a sync.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PvError::RemoteUnavailable(_)
                | PvError::InvalidMetadata(_)
                | PvError::DownloadFailed(_)
                | PvError::Http(_)
        )
    }
}

impl From<serde_json::Error> for PvError {
    fn from(e: serde_json::Error) -> Self {
        PvError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for PvError {
    fn from(e: toml::de::Error) -> Self {
        PvError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pv_error_display() {
        let err = PvError::Config("bad value".to_string());
        assert_eq!(err.to_string(), "configuration error: bad value");
        assert_eq!(PvError::MetadataMissing.to_string(), "store metadata row is missing");
        assert_eq!(PvError::SyncInProgress.to_string(), "sync already in progress");
    }

    #[test]
    fn test_error_classification() {
        assert!(PvError::StoreUnavailable("closed".into()).is_unavailable());
        assert!(!PvError::WriteFailed("x".into()).is_unavailable());
        assert!(PvError::InvalidMetadata("lastModified".into()).is_remote());
        assert!(!PvError::ReplaceFailed("copy".into()).is_remote());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PvError = io.into();
        assert!(matches!(err, PvError::Io(_)));
    }
}
