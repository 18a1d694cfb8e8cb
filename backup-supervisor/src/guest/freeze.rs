//! Guest filesystem freeze with an auto-unfreeze safety timer.

use super::agent_command;
use crate::hypervisor::{Domain, GuestRef, HypervisorConnection};
use crate::state::MetadataCache;
use crate::utils::{Result, SupervisorError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeStatus {
    Frozen,
    Thawed,
}

pub struct FreezeCoordinator {
    conn: Arc<dyn HypervisorConnection>,
    cache: Arc<MetadataCache>,
    /// Persistent vTPM state, flushed before freezing
    vtpm_state_dir: Option<PathBuf>,
    in_progress: AtomicBool,
    safety_timer: Mutex<Option<CancellationToken>>,
}

/// Clears the in-progress flag when the freeze call returns
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FreezeCoordinator {
    pub fn new(
        conn: Arc<dyn HypervisorConnection>,
        cache: Arc<MetadataCache>,
        vtpm_state_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            conn,
            cache,
            vtpm_state_dir,
            in_progress: AtomicBool::new(false),
            safety_timer: Mutex::new(None),
        }
    }

    /// True while a freeze call is in flight
    pub fn freeze_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Freeze the guest filesystems. A zero `auto_unfreeze` disables the
    /// safety timer.
    pub async fn freeze(&self, guest: &GuestRef, auto_unfreeze: Duration) -> Result<()> {
        if self.cache.migration_in_progress() {
            return Err(SupervisorError::GuardViolation(
                "failed to freeze guest, guest is currently during migration".to_string(),
            ));
        }

        let domain = self.conn.lookup_domain_by_name(&guest.domain_name()).await?;
        if freeze_status(domain.as_ref()).await? == FreezeStatus::Frozen {
            info!("Guest {} already frozen", guest);
            return Ok(());
        }

        if let Some(dir) = &self.vtpm_state_dir {
            flush_state_dir(dir).await?;
        }

        {
            let _in_progress = InProgress::set(&self.in_progress);
            agent_command(domain.as_ref(), "guest-fsfreeze-freeze").await?;
        }
        info!("Froze filesystems of guest: {}", guest);

        self.arm_safety_timer(guest, auto_unfreeze);
        Ok(())
    }

    /// Thaw the guest filesystems and cancel any pending safety timer.
    pub async fn unfreeze(&self, guest: &GuestRef) -> Result<()> {
        self.cancel_safety_timer();
        thaw(self.conn.as_ref(), guest).await
    }

    /// Replace any pending timer with a new one.
    fn arm_safety_timer(&self, guest: &GuestRef, timeout: Duration) {
        let mut slot = self.safety_timer.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        if timeout.is_zero() {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let conn = self.conn.clone();
        let guest = guest.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Auto-unfreeze timer cancelled for guest: {}", guest);
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!("Guest {} still frozen after {:?}, unfreezing", guest, timeout);
                    if let Err(e) = thaw(conn.as_ref(), &guest).await {
                        error!("Auto-unfreeze failed for guest {}: {}", guest, e);
                    }
                }
            }
        });
    }

    fn cancel_safety_timer(&self) {
        if let Some(token) = self.safety_timer.lock().take() {
            token.cancel();
        }
    }
}

async fn thaw(conn: &dyn HypervisorConnection, guest: &GuestRef) -> Result<()> {
    let domain = conn.lookup_domain_by_name(&guest.domain_name()).await?;
    if freeze_status(domain.as_ref()).await? == FreezeStatus::Thawed {
        debug!("Guest {} already thawed", guest);
        return Ok(());
    }
    agent_command(domain.as_ref(), "guest-fsfreeze-thaw").await?;
    info!("Thawed filesystems of guest: {}", guest);
    Ok(())
}

pub async fn freeze_status(domain: &dyn Domain) -> Result<FreezeStatus> {
    let reply = agent_command(domain, "guest-fsfreeze-status").await?;
    let reply: serde_json::Value = serde_json::from_str(&reply)?;
    Ok(match reply["return"].as_str() {
        Some("frozen") => FreezeStatus::Frozen,
        _ => FreezeStatus::Thawed,
    })
}

/// `syncfs` the filesystem holding the vTPM state.
async fn flush_state_dir(dir: &Path) -> Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let handle = std::fs::File::open(&dir)?;
        nix::unistd::syncfs(&handle).map_err(std::io::Error::from)?;
        debug!("Flushed vTPM state in {}", dir.display());
        Ok(())
    })
    .await
    .map_err(|e| SupervisorError::Io(std::io::Error::other(e)))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::{FakeConnection, FakeDomain};
    use crate::state::MigrationState;
    use chrono::Utc;

    fn setup(vtpm: Option<PathBuf>) -> (FreezeCoordinator, Arc<FakeDomain>, Arc<MetadataCache>) {
        let domain = FakeDomain::with_xml("<domain/>");
        let (cache, _rx) = MetadataCache::new();
        let conn = Arc::new(FakeConnection {
            domain: Some(domain.clone()),
        });
        (FreezeCoordinator::new(conn, cache.clone(), vtpm), domain, cache)
    }

    fn count(domain: &FakeDomain, call: &str) -> usize {
        domain.calls().iter().filter(|c| *c == call).count()
    }

    fn guest() -> GuestRef {
        GuestRef::new("ns", "vm1", "uid-1")
    }

    #[tokio::test]
    async fn test_freeze_is_idempotent() {
        let (freezer, domain, _) = setup(None);
        freezer.freeze(&guest(), Duration::ZERO).await.unwrap();
        freezer.freeze(&guest(), Duration::ZERO).await.unwrap();
        assert_eq!(count(&domain, "guest-fsfreeze-freeze"), 1);
        assert!(!freezer.freeze_in_progress());
    }

    #[tokio::test]
    async fn test_freeze_refused_during_migration() {
        let (freezer, domain, cache) = setup(None);
        cache.migration.store(MigrationState {
            start_timestamp: Some(Utc::now()),
            ..Default::default()
        });
        let err = freezer.freeze(&guest(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SupervisorError::GuardViolation(_)));
        assert!(domain.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_freeze_clears_in_progress() {
        let (freezer, domain, _) = setup(None);
        domain
            .agent_replies
            .lock()
            .insert("guest-fsfreeze-freeze".into(), "error:agent not connected".into());

        assert!(freezer.freeze(&guest(), Duration::ZERO).await.is_err());
        assert!(!freezer.freeze_in_progress());
    }

    #[tokio::test]
    async fn test_unfreeze() {
        let (freezer, domain, _) = setup(None);
        freezer.unfreeze(&guest()).await.unwrap();
        assert_eq!(count(&domain, "guest-fsfreeze-thaw"), 0);

        freezer.freeze(&guest(), Duration::ZERO).await.unwrap();
        freezer.unfreeze(&guest()).await.unwrap();
        assert_eq!(count(&domain, "guest-fsfreeze-thaw"), 1);
    }

    #[tokio::test]
    async fn test_safety_timer_unfreezes() {
        let (freezer, domain, _) = setup(None);
        freezer.freeze(&guest(), Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count(&domain, "guest-fsfreeze-thaw"), 1);
    }

    #[tokio::test]
    async fn test_unfreeze_cancels_safety_timer() {
        let (freezer, domain, _) = setup(None);
        freezer.freeze(&guest(), Duration::from_millis(100)).await.unwrap();
        freezer.unfreeze(&guest()).await.unwrap();

        // Refreeze so a stray timer would have something to thaw
        freezer.freeze(&guest(), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count(&domain, "guest-fsfreeze-thaw"), 1);
    }

    #[tokio::test]
    async fn test_new_timer_replaces_pending_one() {
        let (freezer, domain, _) = setup(None);
        freezer.freeze(&guest(), Duration::from_millis(100)).await.unwrap();
        freezer.arm_safety_timer(&guest(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count(&domain, "guest-fsfreeze-thaw"), 0);
    }

    #[tokio::test]
    async fn test_vtpm_state_is_flushed_first() {
        let dir = tempfile::tempdir().unwrap();
        let (freezer, domain, _) = setup(Some(dir.path().to_path_buf()));
        freezer.freeze(&guest(), Duration::ZERO).await.unwrap();
        assert_eq!(count(&domain, "guest-fsfreeze-freeze"), 1);

        let (freezer, domain, _) = setup(Some(dir.path().join("missing")));
        assert!(freezer.freeze(&guest(), Duration::ZERO).await.is_err());
        assert_eq!(count(&domain, "guest-fsfreeze-freeze"), 0);
    }
}
