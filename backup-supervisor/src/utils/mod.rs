//! Utility modules for the backup supervisor.

pub mod errors;
pub mod logger;

pub use errors::{Result, SupervisorError};
