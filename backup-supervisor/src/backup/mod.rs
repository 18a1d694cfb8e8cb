//! Backup orchestrator - drives one guest backup through the hypervisor.
//!
//! A backup request runs through:
//! - Migration guard and job idempotency check
//! - Disk enumeration and descriptor generation
//! - Filesystem freeze, `BackupBegin`, thaw
//!
//! The outcome always lands in the shared backup job cell, which the
//! status reconciler reports from.

pub mod descriptor;

use crate::cbt::image::image_info;
use crate::hypervisor::{
    parse_domain_disks, CheckpointCreateFlags, Domain, GuestRef, HypervisorConnection, JobCompletedEvent,
    JobInfo, JobOperation, JobStatsFlags, JobType,
};
use crate::state::{BackupJob, BackupMode, MetadataCache};
use crate::utils::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use descriptor::{CheckpointDisk, CheckpointDisks, DomainCheckpoint};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters of one backup request
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub skip_quiesce: bool,
    /// Checkpoint the backup is incremental from
    pub incremental_from: Option<String>,
    /// Push target directory root (scratch directory in pull mode)
    pub target_path: Option<PathBuf>,
    pub mode: BackupMode,
}

/// Checkpoint to re-register with the hypervisor after a restart
#[derive(Debug, Clone)]
pub struct BackupCheckpoint {
    pub name: String,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Same backup already running; nothing was done
    AlreadyRunning,
}

pub struct BackupOrchestrator {
    conn: Arc<dyn HypervisorConnection>,
    cache: Arc<MetadataCache>,
    pull_socket: PathBuf,
    image_tool: String,
}

impl BackupOrchestrator {
    pub fn new(
        conn: Arc<dyn HypervisorConnection>,
        cache: Arc<MetadataCache>,
        pull_socket: impl Into<PathBuf>,
        image_tool: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            cache,
            pull_socket: pull_socket.into(),
            image_tool: image_tool.into(),
        }
    }

    /// Start a backup. Repeating the request of a running backup succeeds
    /// without doing anything.
    pub async fn start_backup(&self, guest: &GuestRef, options: &BackupOptions) -> Result<StartOutcome> {
        if self.cache.migration_in_progress() {
            return Err(SupervisorError::GuardViolation(
                "failed to do backup, guest is currently during migration".to_string(),
            ));
        }

        if self.initialize_job(options)? {
            info!("Backup {} already in progress for guest: {}", options.name, guest);
            return Ok(StartOutcome::AlreadyRunning);
        }

        info!(backup = %options.name, "Starting {} backup for guest: {}", options.mode.as_str(), guest);
        if let Err(e) = self.backup(guest, options).await {
            error!(backup = %options.name, "Backup failed for guest {}: {}", guest, e);
            self.cache.backup.store(BackupJob::default());
            return Err(e);
        }
        Ok(StartOutcome::Started)
    }

    /// Returns true when the same backup is already running.
    fn initialize_job(&self, options: &BackupOptions) -> Result<bool> {
        self.cache.backup.with_exclusive_access(|job, exists| {
            if exists && !job.is_empty() {
                if job.is_same(&options.name, &options.start_time) {
                    if !job.is_finished() {
                        return Ok(true);
                    }
                    return Err(SupervisorError::Conflict(format!(
                        "backup {} already executed at {}",
                        options.name, options.start_time
                    )));
                }
                if !job.is_finished() {
                    return Err(SupervisorError::Conflict(format!(
                        "backup {} already in progress, cannot start {}",
                        job.name, options.name
                    )));
                }
            }

            *job = BackupJob {
                name: options.name.clone(),
                start_timestamp: Some(options.start_time),
                skip_quiesce: options.skip_quiesce,
                mode: options.mode,
                ..Default::default()
            };
            Ok(false)
        })
    }

    async fn backup(&self, guest: &GuestRef, options: &BackupOptions) -> Result<()> {
        let domain = self.conn.lookup_domain_by_name(&guest.domain_name()).await?;
        let xml = domain.xml_desc().await?;
        let disks = parse_domain_disks(&xml)?;

        let backup_dir = match &options.target_path {
            Some(target) => {
                let dir = descriptor::backup_path(target, options, &guest.name);
                tokio::fs::create_dir_all(&dir).await?;
                info!("Created backup directory: {}", dir.display());
                Some(dir)
            }
            None => None,
        };

        let result = self.begin(domain.as_ref(), &disks, options, backup_dir.as_deref()).await;
        if result.is_err() {
            if let Some(dir) = &backup_dir {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    warn!("Failed to remove backup directory {}: {}", dir.display(), e);
                }
            }
        }
        result
    }

    async fn begin(
        &self,
        domain: &dyn Domain,
        disks: &[crate::hypervisor::Disk],
        options: &BackupOptions,
        backup_dir: Option<&Path>,
    ) -> Result<()> {
        let (backup, checkpoint, volumes) =
            descriptor::generate_domain_backup(disks, options, backup_dir, &self.pull_socket);
        let backup_xml = backup.to_xml()?;
        let checkpoint_xml = checkpoint.to_xml()?;

        self.cache.backup.with_exclusive_access(|job, _| {
            job.checkpoint_name = checkpoint.name.clone();
            job.volumes = volumes;
        });

        let mut frozen = false;
        if !options.skip_quiesce {
            match domain.fs_freeze().await {
                Ok(()) => frozen = true,
                Err(e) => {
                    warn!(backup = %options.name, "Failed freezing guest filesystem, continuing unfrozen: {}", e);
                    self.set_message(format!("Failed freezing guest filesystem: {}", e));
                }
            }
        }

        let result = domain.backup_begin(&backup_xml, &checkpoint_xml, 0).await;

        if frozen {
            if let Err(e) = domain.fs_thaw().await {
                error!(backup = %options.name, "Failed to unfreeze filesystem: {}", e);
                self.set_message("Failed to unfreeze filesystem after backup completion".to_string());
            }
        }

        result?;
        info!(backup = %options.name, "Backup started with checkpoint: {}", checkpoint.name);
        Ok(())
    }

    fn set_message(&self, message: String) {
        self.cache.backup.with_exclusive_access(|job, _| job.message = message);
    }

    /// Record the end of the hypervisor backup job.
    pub async fn handle_job_completed_event(&self, domain: Option<&dyn Domain>, event: &JobCompletedEvent) {
        let (job, exists) = self.cache.backup.load();
        if !exists || job.is_empty() {
            info!("Job completed event without a backup job, ignoring");
            return;
        }

        let stats = match domain {
            Some(d) => match d.get_job_stats(JobStatsFlags::Completed).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(backup = %job.name, "Failed to get completed job stats: {}", e);
                    None
                }
            },
            None => None,
        };
        // Final stats decide the outcome over the event's own type
        let mut info = event.info.clone();
        if let Some(stats) = stats {
            info.job_type = stats.job_type;
            if info.error_message.is_none() {
                info.error_message = stats.error_message;
            }
        }

        if info.job_type != JobType::Completed {
            warn!(
                backup = %job.name,
                "Backup job ended with type {:?}, marking it completed",
                info.job_type
            );
        }
        let error_message = info.error_message.clone();
        let (failed, message) = completion_outcome(job.mode, &info, error_message);

        self.cache.backup.with_exclusive_access(|current, _| {
            if current.name != job.name {
                warn!("Backup job changed from {} to {} before completion, ignoring", job.name, current.name);
                return;
            }
            current.completed = true;
            current.end_timestamp = Some(Utc::now());
            current.failed = failed;
            if !message.is_empty() {
                current.message = message;
            }
        });
        info!(backup = %job.name, "Backup completed (failed: {})", failed);
    }

    /// Abort the running backup matching `options`.
    pub async fn abort_backup(&self, guest: &GuestRef, options: &BackupOptions) -> Result<()> {
        let (job, exists) = self.cache.backup.load();
        if !exists || job.is_empty() {
            return Err(SupervisorError::NotFound(format!(
                "failed to abort backup {}: no backup job",
                options.name
            )));
        }
        if job.start_timestamp.is_none() {
            return Err(SupervisorError::Conflict(format!(
                "failed to abort backup {}: backup has not started",
                options.name
            )));
        }
        if !job.is_same(&options.name, &options.start_time) {
            return Err(SupervisorError::Conflict(format!(
                "failed to abort backup {}: running backup is {}",
                options.name, job.name
            )));
        }
        if job.completed {
            return Err(SupervisorError::Conflict(format!(
                "failed to abort backup {}: backup already completed",
                options.name
            )));
        }

        let domain = self.conn.lookup_domain_by_name(&guest.domain_name()).await?;
        let stats = domain.get_job_stats(JobStatsFlags::Current).await?;
        if stats.operation != JobOperation::Backup || stats.job_type != JobType::Unbounded {
            return Err(SupervisorError::Conflict(format!(
                "failed to abort backup {}: current job is {:?}/{:?}",
                options.name, stats.operation, stats.job_type
            )));
        }

        domain.abort_job().await?;
        info!(backup = %options.name, "Aborted backup for guest: {}", guest);
        Ok(())
    }

    /// Re-register a checkpoint whose bitmaps survive in the overlays.
    ///
    /// Fails with [`SupervisorError::CheckpointInvalid`] when no disk still
    /// carries the bitmap or the hypervisor rejects it as inconsistent.
    pub async fn redefine_checkpoint(&self, guest: &GuestRef, checkpoint: &BackupCheckpoint) -> Result<()> {
        let domain = self.conn.lookup_domain_by_name(&guest.domain_name()).await?;
        let xml = domain.xml_desc().await?;
        let disks = parse_domain_disks(&xml)?;

        let mut checkpoint_disks = CheckpointDisks::default();
        for disk in &disks {
            let Some(overlay) = disk.source.file.as_deref().filter(|_| disk.has_data_store()) else {
                continue;
            };
            let info = image_info(&self.image_tool, Path::new(overlay)).await?;
            if info.has_bitmap(&checkpoint.name) {
                checkpoint_disks.disks.push(CheckpointDisk {
                    name: disk.target.device.clone(),
                    checkpoint: "bitmap".to_string(),
                });
            }
        }

        if checkpoint_disks.disks.is_empty() {
            return Err(SupervisorError::CheckpointInvalid(format!(
                "no disk carries a bitmap for checkpoint {}",
                checkpoint.name
            )));
        }

        let descriptor = DomainCheckpoint {
            name: checkpoint.name.clone(),
            creation_time: checkpoint.creation_time.map(|t| t.timestamp()),
            disks: checkpoint_disks,
        };
        let checkpoint_xml = descriptor.to_xml()?;

        match domain
            .create_checkpoint_xml(&checkpoint_xml, CheckpointCreateFlags::redefine())
            .await
        {
            Ok(()) => {
                info!("Redefined checkpoint {} for guest: {}", checkpoint.name, guest);
                Ok(())
            }
            Err(e) if e.is_checkpoint_invalid() => Err(SupervisorError::CheckpointInvalid(format!(
                "checkpoint {}: {}",
                checkpoint.name, e.message
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Failure flag and message for a finished backup job.
fn completion_outcome(mode: BackupMode, info: &JobInfo, error_message: Option<String>) -> (bool, String) {
    let (failed, mut message) = match info.job_type {
        JobType::Completed => return (false, String::new()),
        JobType::Cancelled => (mode == BackupMode::Push, "backup aborted".to_string()),
        JobType::Failed => (true, String::new()),
        other => (true, format!("unexpected job completion type: {}", other.code())),
    };

    if let Some(err) = error_message.filter(|e| !e.is_empty()) {
        message = if message.is_empty() {
            err
        } else {
            format!("{}: {}", message, err)
        };
    }
    if failed && message.is_empty() {
        message = "unknown failure reason".to_string();
    }
    (failed, message)
}
