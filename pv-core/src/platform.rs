//! Platform directory resolution.

use std::path::PathBuf;
use crate::constants::APP_NAME;
use crate::error::{PvError, PvResult};

/// Detected operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    /// Detect the current platform at compile time.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Get the application-private data directory holding the store.
    ///
    /// - Windows: `%APPDATA%/PatientVault`
    /// - macOS: `~/Library/Application Support/PatientVault`
    /// - Linux: `~/.local/share/PatientVault`
    pub fn data_dir() -> PvResult<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| PvError::Config("could not determine data directory".into()))?;
        Ok(base.join(APP_NAME))
    }

    /// Get the platform-specific configuration directory.
    pub fn config_dir() -> PvResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| PvError::Config("could not determine config directory".into()))?;
        Ok(base.join(APP_NAME))
    }

    /// Get the user-visible documents directory used for exports.
    ///
    /// Falls back to the home directory on systems without a documents folder.
    pub fn documents_dir() -> PvResult<PathBuf> {
        dirs::document_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| PvError::Config("could not determine documents directory".into()))
    }

    /// Get a human-readable platform name.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows",
            Platform::MacOs => "macOS",
            Platform::Linux => "Linux",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
