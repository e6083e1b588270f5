//! Patient Vault Models - Local store handle, schema, migrations, and entity models.
//!
//! This crate owns all data persistence: opening the (optionally SQLCipher
//! encrypted) SQLite store, versioned migrations, the patient and metadata
//! models, snapshot export, and the protocol that swaps the whole store file
//! for a downloaded copy while the application keeps running.

pub mod db;
pub mod encryption;
pub mod migrations;
pub mod models;
pub mod replace;
pub mod schema;

// Re-export key types
pub use db::{DbPool, EncryptionConfig, StoreConfig, StoreHandle, StoreStats};
pub use models::patient::Patient;
pub use models::store_info::StoreInfo;
