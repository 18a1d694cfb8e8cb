//! Changed block tracking overlays.
//!
//! Every tracked volume gets a qcow2 overlay whose raw data file is the
//! volume itself. Dirty bitmaps for checkpoints live in the overlay.

pub mod image;
pub mod qmp;

use crate::config::CbtConfig;
use crate::hypervisor::GuestRef;
use crate::state::{ChangedBlockTrackingState, MetadataCache};
use crate::utils::{Result, SupervisorError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub struct OverlayManager {
    config: CbtConfig,
    guest: GuestRef,
    cache: Arc<MetadataCache>,
}

impl OverlayManager {
    pub fn new(config: CbtConfig, guest: GuestRef, cache: Arc<MetadataCache>) -> Self {
        Self { config, guest, cache }
    }

    /// `{overlay_dir}/{guest uid}/{volume}.qcow2`
    pub fn overlay_path(&self, volume: &str) -> PathBuf {
        self.config
            .overlay_dir
            .join(&self.guest.uid)
            .join(format!("{}.qcow2", volume))
    }

    /// Make sure the overlay of `volume` exists when CBT needs one.
    ///
    /// Returns `None` when CBT does not track the volume. An enabled volume
    /// already has its overlay; only an initializing one gets it created.
    pub async fn ensure_overlay(&self, volume: &str, image_path: &Path, is_block: bool) -> Result<Option<PathBuf>> {
        let overlay = self.overlay_path(volume);
        match self.cache.cbt_state(volume) {
            ChangedBlockTrackingState::Enabled => return Ok(Some(overlay)),
            ChangedBlockTrackingState::Initializing => {}
            state => {
                debug!(volume = %volume, "CBT state {:?}, no overlay", state);
                return Ok(None);
            }
        }

        if tokio::fs::try_exists(&overlay).await? {
            info!(volume = %volume, "Overlay already exists: {}", overlay.display());
            self.record_overlay(volume, &overlay);
            return Ok(Some(overlay));
        }

        if let Some(parent) = overlay.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.create_overlay(&overlay, image_path, is_block).await {
            error!(volume = %volume, "Failed to create overlay {}: {}", overlay.display(), e);
            if let Err(rm) = tokio::fs::remove_file(&overlay).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial overlay {}: {}", overlay.display(), rm);
                }
            }
            return Err(e);
        }

        info!(volume = %volume, "Created overlay {} over {}", overlay.display(), image_path.display());
        self.record_overlay(volume, &overlay);
        Ok(Some(overlay))
    }

    fn record_overlay(&self, volume: &str, overlay: &Path) {
        self.cache.cbt.with_exclusive_access(|volumes, _| {
            volumes.entry(volume.to_string()).or_default().overlay_path = Some(overlay.to_path_buf());
        });
    }

    /// Image info, daemon session and daemon exit all share one deadline.
    async fn create_overlay(&self, overlay: &Path, image_path: &Path, is_block: bool) -> Result<()> {
        let limit = self.config.create_timeout();
        match tokio::time::timeout(limit, self.run_create(overlay, image_path, is_block)).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Timeout(format!(
                "overlay creation for {} exceeded {:?}",
                overlay.display(),
                limit
            ))),
        }
    }

    async fn run_create(&self, overlay: &Path, image_path: &Path, is_block: bool) -> Result<()> {
        let size = image::image_info(&self.config.image_tool, image_path).await?.virtual_size;
        if size == 0 {
            return Err(SupervisorError::Io(std::io::Error::other(format!(
                "image {} reports no virtual size",
                image_path.display()
            ))));
        }

        tokio::fs::File::create(overlay).await?;

        let data_driver = if is_block { "host_device" } else { "file" };
        let mut child = Command::new(&self.config.storage_daemon)
            .arg("--blockdev")
            .arg(format!(
                "driver=file,node-name={},filename={}",
                qmp::OVERLAY_NODE,
                overlay.display()
            ))
            .arg("--blockdev")
            .arg(format!(
                "driver={},node-name={},filename={}",
                data_driver,
                qmp::DATA_NODE,
                image_path.display()
            ))
            .arg("--chardev")
            .arg("stdio,id=qmp0")
            .arg("--monitor")
            .arg("chardev=qmp0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SupervisorError::Io(std::io::Error::other("storage daemon stdio not captured")));
        };

        let transcript =
            qmp::run_overlay_qmp_session(stdin, stdout, size, overlay, self.config.create_timeout()).await;
        let transcript = match transcript {
            Ok(t) => t,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        debug!("Overlay session for {}:\n{}", overlay.display(), transcript);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SupervisorError::Io(std::io::Error::other(format!(
                "storage daemon exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }
}
