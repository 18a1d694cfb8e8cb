//! Backup and checkpoint descriptors handed to `BackupBegin`.

use super::BackupOptions;
use crate::hypervisor::Disk;
use crate::state::{BackupMode, BackupVolumeInfo};
use crate::utils::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Serialize)]
pub struct DomainBackup {
    #[serde(rename = "@mode")]
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<BackupServer>,
    pub disks: BackupDisks,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupServer {
    #[serde(rename = "@transport")]
    pub transport: String,
    #[serde(rename = "@socket")]
    pub socket: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupDisks {
    #[serde(rename = "disk", default)]
    pub disks: Vec<BackupDisk>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupDisk {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@backup")]
    pub backup: String,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "@exportname", skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
    #[serde(rename = "@exportbitmap", skip_serializing_if = "Option::is_none")]
    pub export_bitmap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch: Option<BackupFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    #[serde(rename = "@file")]
    pub file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainCheckpoint {
    pub name: String,
    #[serde(rename = "creationTime", skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,
    pub disks: CheckpointDisks,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointDisks {
    #[serde(rename = "disk", default)]
    pub disks: Vec<CheckpointDisk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointDisk {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@checkpoint")]
    pub checkpoint: String,
}

impl DomainBackup {
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string_with_root("domainbackup", self)
            .map_err(|e| SupervisorError::Xml(e.to_string()))
    }
}

impl DomainCheckpoint {
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string_with_root("domaincheckpoint", self)
            .map_err(|e| SupervisorError::Xml(e.to_string()))
    }
}

pub fn backup_time_formatted(time: &DateTime<Utc>) -> String {
    time.format(BACKUP_TIME_FORMAT).to_string()
}

/// Checkpoint created by a backup: `{backup}-{start time}`
pub fn checkpoint_name(options: &BackupOptions) -> String {
    format!("{}-{}", options.name, backup_time_formatted(&options.start_time))
}

/// `{target}/{guest}/{backup}-{start time}`
pub fn backup_path(target: &Path, options: &BackupOptions, guest_name: &str) -> PathBuf {
    target.join(guest_name).join(checkpoint_name(options))
}

/// `{dir}/{backup}-{volume}.qcow2`
pub fn target_qcow2_file(dir: &Path, backup_name: &str, volume_name: &str) -> PathBuf {
    dir.join(format!("{}-{}.qcow2", backup_name, volume_name))
}

/// Build the backup and checkpoint descriptors for every disk of the guest.
///
/// Disks without a target device are left out. Disks without a data store
/// (no CBT overlay) are listed with backup/checkpoint disabled.
pub fn generate_domain_backup(
    disks: &[Disk],
    options: &BackupOptions,
    backup_dir: Option<&Path>,
    pull_socket: &Path,
) -> (DomainBackup, DomainCheckpoint, Vec<BackupVolumeInfo>) {
    let incremental = options
        .incremental_from
        .as_ref()
        .filter(|from| !from.is_empty())
        .cloned();
    if let Some(from) = &incremental {
        info!(
            "Generating incremental backup {} from checkpoint: {}",
            options.name, from
        );
    }

    let server = match options.mode {
        BackupMode::Pull => Some(BackupServer {
            transport: "unix".to_string(),
            socket: pull_socket.display().to_string(),
        }),
        BackupMode::Push => None,
    };

    let checkpoint = checkpoint_name(options);
    let mut backup_disks = BackupDisks::default();
    let mut checkpoint_disks = CheckpointDisks::default();
    let mut volumes = Vec::new();

    for disk in disks {
        if disk.target.device.is_empty() {
            continue;
        }
        let device = disk.target.device.clone();
        let mut backup_disk = BackupDisk {
            name: device.clone(),
            ..Default::default()
        };
        let checkpoint_mode;

        if disk.has_data_store() {
            let volume = disk.volume_name();
            backup_disk.backup = "yes".to_string();
            backup_disk.kind = Some("file".to_string());
            if options.mode == BackupMode::Pull {
                backup_disk.export_name = Some(volume.clone());
                backup_disk.export_bitmap = Some(checkpoint.clone());
            }
            if let Some(dir) = backup_dir {
                let file = BackupFile {
                    file: target_qcow2_file(dir, &options.name, &volume).display().to_string(),
                };
                match options.mode {
                    BackupMode::Push => backup_disk.target = Some(file),
                    BackupMode::Pull => backup_disk.scratch = Some(file),
                }
            }
            checkpoint_mode = "bitmap";
            volumes.push(BackupVolumeInfo {
                volume_name: volume,
                disk_target: device.clone(),
            });
        } else {
            backup_disk.backup = "no".to_string();
            checkpoint_mode = "no";
        }

        backup_disks.disks.push(backup_disk);
        checkpoint_disks.disks.push(CheckpointDisk {
            name: device,
            checkpoint: checkpoint_mode.to_string(),
        });
    }

    let domain_backup = DomainBackup {
        mode: options.mode.as_str().to_string(),
        incremental,
        server,
        disks: backup_disks,
    };
    let domain_checkpoint = DomainCheckpoint {
        name: checkpoint,
        creation_time: None,
        disks: checkpoint_disks,
    };
    (domain_backup, domain_checkpoint, volumes)
}
