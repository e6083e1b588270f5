//! Patient Vault Drive - the remote side of sync.
//!
//! Defines the [`BlobStore`] boundary the sync coordinator talks to, with a
//! Google Drive v3 implementation scoped to the app data folder and a plain
//! directory implementation for shared folders and tests. Also provides the
//! trusted time source used to calibrate write timestamps.

pub mod blob;
pub mod drive;
pub mod folder;
pub mod time;

// Re-export key types
pub use blob::{BlobQuery, BlobStore, NewBlob, RemoteBlob};
pub use drive::{DriveClient, RetryConfig};
pub use folder::FolderBlobStore;
pub use time::{HttpDateTimeSource, TimeSource};
