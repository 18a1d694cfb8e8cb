//! Hypervisor seam.
//!
//! The supervisor never talks to the hypervisor library directly; the
//! embedding process provides a [`HypervisorConnection`] and the components
//! here drive guests through the [`Domain`] operations they need.

pub mod domain_xml;
pub mod reconnect;

pub use domain_xml::{parse_domain_disks, Disk};
pub use reconnect::ReconnectReplay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Identity of a guest
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl GuestRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Name the hypervisor knows the guest by
    pub fn domain_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorErrorKind {
    NoDomain,
    InvalidCheckpoint,
    NoCheckpoint,
    CheckpointInconsistent,
    AgentUnavailable,
    OperationFailed,
}

#[derive(Error, Debug, Clone)]
#[error("hypervisor error ({kind:?}): {message}")]
pub struct HypervisorError {
    pub kind: HypervisorErrorKind,
    pub message: String,
}

impl HypervisorError {
    pub fn new(kind: HypervisorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(HypervisorErrorKind::OperationFailed, message)
    }

    /// The checkpoint bitmap is corrupt, missing or inconsistent.
    pub fn is_checkpoint_invalid(&self) -> bool {
        matches!(
            self.kind,
            HypervisorErrorKind::InvalidCheckpoint
                | HypervisorErrorKind::NoCheckpoint
                | HypervisorErrorKind::CheckpointInconsistent
        )
    }
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

/// Job type as reported by job stats and job-completed events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    None,
    Bounded,
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

impl JobType {
    pub fn code(&self) -> u32 {
        match self {
            JobType::None => 0,
            JobType::Bounded => 1,
            JobType::Unbounded => 2,
            JobType::Completed => 3,
            JobType::Failed => 4,
            JobType::Cancelled => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    Unknown,
    MigrationIn,
    MigrationOut,
    Dump,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_type: JobType,
    pub operation: JobOperation,
    pub error_message: Option<String>,
}

impl JobInfo {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            operation: JobOperation::Unknown,
            error_message: None,
        }
    }
}

/// Payload of the hypervisor's job-completed event
#[derive(Debug, Clone)]
pub struct JobCompletedEvent {
    pub info: JobInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatsFlags {
    Current,
    /// Stats of the job that just completed
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Raw,
    Elf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCreateFlags {
    pub redefine: bool,
    pub redefine_validate: bool,
}

impl CheckpointCreateFlags {
    pub fn redefine() -> Self {
        Self {
            redefine: true,
            redefine_validate: true,
        }
    }
}

/// Operations consumed on a single guest domain
#[async_trait]
pub trait Domain: Send + Sync {
    /// Live domain XML
    async fn xml_desc(&self) -> HypervisorResult<String>;

    async fn fs_freeze(&self) -> HypervisorResult<()>;

    async fn fs_thaw(&self) -> HypervisorResult<()>;

    /// Raw guest-agent command; returns the agent's JSON reply
    async fn qemu_agent_command(&self, command: &str) -> HypervisorResult<String>;

    async fn backup_begin(&self, backup_xml: &str, checkpoint_xml: &str, flags: u32) -> HypervisorResult<()>;

    async fn get_job_stats(&self, flags: JobStatsFlags) -> HypervisorResult<JobInfo>;

    async fn abort_job(&self) -> HypervisorResult<()>;

    async fn create_checkpoint_xml(&self, xml: &str, flags: CheckpointCreateFlags) -> HypervisorResult<()>;

    async fn core_dump_with_format(&self, path: &Path, format: DumpFormat, memory_only: bool) -> HypervisorResult<()>;
}

#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    async fn lookup_domain_by_name(&self, name: &str) -> HypervisorResult<Arc<dyn Domain>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_name() {
        let guest = GuestRef::new("ns", "vm1", "uid-1");
        assert_eq!(guest.domain_name(), "ns_vm1");
        assert_eq!(guest.to_string(), "ns/vm1");
    }

    #[test]
    fn test_checkpoint_invalid_classification() {
        assert!(HypervisorError::new(HypervisorErrorKind::NoCheckpoint, "x").is_checkpoint_invalid());
        assert!(!HypervisorError::failed("x").is_checkpoint_invalid());
        assert_eq!(JobType::Bounded.code(), 1);
    }
}
