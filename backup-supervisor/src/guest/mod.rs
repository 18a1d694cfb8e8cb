//! Guest-side operations driven through the guest agent and hypervisor.

pub mod freeze;
pub mod memory_dump;

pub use freeze::{FreezeCoordinator, FreezeStatus};
pub use memory_dump::MemoryDumpController;

use crate::hypervisor::{Domain, HypervisorResult};
use serde_json::json;

/// Send an argument-less guest agent command.
pub(crate) async fn agent_command(domain: &dyn Domain, name: &str) -> HypervisorResult<String> {
    domain
        .qemu_agent_command(&json!({ "execute": name }).to_string())
        .await
}
