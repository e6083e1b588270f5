//! Patient Vault Services - sync and record management on top of the store.
//!
//! This crate provides:
//! - The typed application event bus (store replaced, sync status, faults)
//! - The `Service` lifecycle trait
//! - `SyncCoordinator`: periodic last-write-wins reconciliation with the remote
//! - `PatientRepository`: validated record CRUD through the store handle
//! - `AppContext`: wiring of config, store, remote and services

pub mod context;
pub mod event_bus;
pub mod repository;
pub mod service;
pub mod sync;

// Re-export key types
pub use context::{build_blob_store, AppContext};
pub use event_bus::{AppEvent, EventBus};
pub use repository::{PatientRepository, SaveReport};
pub use service::{Service, ServiceState};
pub use sync::{SyncCoordinator, SyncOutcome, SyncSettings, SyncState};
