//! Cross-restart state shared between the supervisor components.
//!
//! Every entry lives in a [`SafeCell`]; the status reconciler listens on the
//! cache's notification channel and reads the cells back.

pub mod cache;

pub use cache::SafeCell;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where backup data goes: written by the hypervisor (push) or exported for
/// an external consumer (pull).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[default]
    Push,
    Pull,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Push => "push",
            BackupMode::Pull => "pull",
        }
    }
}

/// Volume included in a backup and the disk target it is attached as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVolumeInfo {
    pub volume_name: String,
    pub disk_target: String,
}

/// The single backup job tracked per guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub name: String,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub skip_quiesce: bool,
    pub mode: BackupMode,
    pub checkpoint_name: String,
    pub completed: bool,
    pub failed: bool,
    /// Failure reason or freeze/thaw remark
    pub message: String,
    pub volumes: Vec<BackupVolumeInfo>,
}

impl BackupJob {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.end_timestamp.is_some()
    }

    /// Same backup name and start time
    pub fn is_same(&self, name: &str, start: &DateTime<Utc>) -> bool {
        self.name == name && self.start_timestamp.as_ref() == Some(start)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangedBlockTrackingState {
    #[default]
    Undefined,
    Initializing,
    Enabled,
    Disabled,
}

/// CBT status of one volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeCbt {
    pub state: ChangedBlockTrackingState,
    pub overlay_path: Option<PathBuf>,
}

pub type CbtVolumes = BTreeMap<String, VolumeCbt>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDumpState {
    pub file_name: String,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub completed: bool,
    pub failed: bool,
    pub failure_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub uid: String,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl MigrationState {
    pub fn in_progress(&self) -> bool {
        self.start_timestamp.is_some() && self.end_timestamp.is_none()
    }
}

/// All persisted entries of one guest, sharing one notification channel.
pub struct MetadataCache {
    pub backup: SafeCell<BackupJob>,
    pub cbt: SafeCell<CbtVolumes>,
    pub memory_dump: SafeCell<MemoryDumpState>,
    pub migration: SafeCell<MigrationState>,
}

impl MetadataCache {
    /// Build a cache and the receiver observers wait on.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (tx, rx) = cache::notification_channel();
        let cache = Self {
            backup: SafeCell::new(tx.clone()),
            cbt: SafeCell::new(tx.clone()),
            memory_dump: SafeCell::new(tx.clone()),
            migration: SafeCell::new(tx),
        };
        (Arc::new(cache), rx)
    }

    pub fn migration_in_progress(&self) -> bool {
        let (migration, _) = self.migration.load();
        migration.in_progress()
    }

    pub fn cbt_state(&self, volume: &str) -> ChangedBlockTrackingState {
        let (volumes, _) = self.cbt.load();
        volumes
            .get(volume)
            .map(|v| v.state)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_job_identity() {
        let start = Utc::now();
        let job = BackupJob {
            name: "b1".to_string(),
            start_timestamp: Some(start),
            ..Default::default()
        };
        assert!(!job.is_empty());
        assert!(!job.is_finished());
        assert!(job.is_same("b1", &start));
        assert!(!job.is_same("b2", &start));
        assert!(BackupJob::default().is_empty());
    }

    #[test]
    fn test_migration_in_progress() {
        let (cache, _rx) = MetadataCache::new();
        assert!(!cache.migration_in_progress());

        cache.migration.store(MigrationState {
            start_timestamp: Some(Utc::now()),
            ..Default::default()
        });
        assert!(cache.migration_in_progress());

        cache.migration.with_exclusive_access(|m, _| m.end_timestamp = Some(Utc::now()));
        assert!(!cache.migration_in_progress());
    }

    #[test]
    fn test_cbt_state_defaults_to_undefined() {
        let (cache, _rx) = MetadataCache::new();
        assert_eq!(cache.cbt_state("disk0"), ChangedBlockTrackingState::Undefined);
        cache.cbt.with_exclusive_access(|volumes, _| {
            volumes.insert(
                "disk0".to_string(),
                VolumeCbt {
                    state: ChangedBlockTrackingState::Enabled,
                    overlay_path: None,
                },
            );
        });
        assert_eq!(cache.cbt_state("disk0"), ChangedBlockTrackingState::Enabled);
    }
}
