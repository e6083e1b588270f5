//! Entity model definitions.

pub mod patient;
pub mod store_info;
