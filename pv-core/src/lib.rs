//! Patient Vault Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by all other Patient Vault crates:
//! - Application configuration (store location, encryption, sync, remote backend)
//! - Global error types covering every failure category of the store and sync
//! - Structured logging with tracing
//! - Platform directory resolution
//! - Clock abstraction used to stamp store mutations

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod platform;

// Re-export commonly used items at the crate root
pub use clock::{Clock, ManualClock, OffsetClock, SystemClock};
pub use config::{AppConfig, ConfigHandle};
pub use error::{PvError, PvResult};
pub use logging::init_logging;
pub use platform::Platform;
