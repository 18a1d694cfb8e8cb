//! Backup Supervisor Library
//!
//! VM disk backup data plane: coordinated freeze/backup/thaw, changed block
//! tracking overlays, and a block export served over a reconnecting tunnel.

pub mod backup;
pub mod cbt;
pub mod config;
pub mod daemon;
pub mod export;
pub mod guest;
pub mod hypervisor;
pub mod state;
pub mod tunnel;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, SupervisorError};
