//! Custom error types for the backup supervisor.

use crate::hypervisor::HypervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A precondition of the guest forbids the operation (e.g. migration in progress)
    #[error("Guard violation: {0}")]
    GuardViolation(String),

    /// Concurrent or duplicate backup request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Dial, TLS handshake or CONNECT failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unsupported context, malformed block-status, no forward progress
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    /// The single-connection listener's connection has closed
    #[error("Listener closed")]
    ListenerClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Checkpoint bitmap missing, corrupt or inconsistent; a full backup is needed
    #[error("Invalid checkpoint: {0}")]
    CheckpointInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl SupervisorError {
    /// Cancellation is a clean exit, never a classified failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SupervisorError::Cancelled)
    }

    /// Short classification used on the export wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::GuardViolation(_) => "guard",
            SupervisorError::Conflict(_) => "conflict",
            SupervisorError::Transport(_) | SupervisorError::Http(_) => "transport",
            SupervisorError::Protocol(_) => "protocol",
            SupervisorError::Io(_) => "io",
            SupervisorError::Cancelled => "cancelled",
            SupervisorError::Timeout(_) => "timeout",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::CheckpointInvalid(_) => "checkpoint_invalid",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_a_failure_kind() {
        assert!(SupervisorError::Cancelled.is_cancelled());
        assert_eq!(SupervisorError::Cancelled.kind(), "cancelled");
        assert!(!SupervisorError::Protocol("x".into()).is_cancelled());
        assert_eq!(SupervisorError::Protocol("x".into()).kind(), "protocol");
    }
}
