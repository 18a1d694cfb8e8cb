//! Single-flight background memory dump.

use crate::hypervisor::{DumpFormat, GuestRef, HypervisorConnection};
use crate::state::{MemoryDumpState, MetadataCache};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Capacity-1 token channel used as a non-blocking lock
struct DumpSlot {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl DumpSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx: Mutex::new(rx) }
    }

    fn try_acquire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    fn release(&self) {
        let _ = self.rx.lock().try_recv();
    }
}

pub struct MemoryDumpController {
    conn: Arc<dyn HypervisorConnection>,
    cache: Arc<MetadataCache>,
    slot: Arc<DumpSlot>,
}

impl MemoryDumpController {
    pub fn new(conn: Arc<dyn HypervisorConnection>, cache: Arc<MetadataCache>) -> Self {
        Self {
            conn,
            cache,
            slot: Arc::new(DumpSlot::new()),
        }
    }

    /// Start a memory-only dump of the guest to `path` in the background.
    ///
    /// Requests arriving while a dump runs are dropped. The outcome is
    /// recorded in the memory dump cell.
    pub fn dump(&self, guest: &GuestRef, path: &Path) {
        if !self.slot.try_acquire() {
            info!("Memory dump already in progress, dropping request for {}", path.display());
            return;
        }

        let conn = self.conn.clone();
        let cache = self.cache.clone();
        let slot = self.slot.clone();
        let guest = guest.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            run_dump(conn.as_ref(), &cache, &guest, path).await;
            slot.release();
        });
    }
}

async fn run_dump(conn: &dyn HypervisorConnection, cache: &MetadataCache, guest: &GuestRef, path: PathBuf) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (state, _) = cache.memory_dump.load();
    if !file_name.is_empty() && state.file_name == file_name {
        debug!("Memory dump {} already taken, skipping", file_name);
        return;
    }

    cache.memory_dump.store(MemoryDumpState {
        file_name: file_name.clone(),
        start_timestamp: Some(Utc::now()),
        ..Default::default()
    });
    info!("Starting memory dump of guest {} to {}", guest, path.display());

    let result = match conn.lookup_domain_by_name(&guest.domain_name()).await {
        Ok(domain) => domain.core_dump_with_format(&path, DumpFormat::Raw, true).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) => info!("Memory dump of guest {} completed: {}", guest, path.display()),
        Err(e) => error!("Memory dump of guest {} failed: {}", guest, e),
    }

    cache.memory_dump.with_exclusive_access(|state, _| {
        if state.file_name != file_name {
            return;
        }
        state.end_timestamp = Some(Utc::now());
        match result {
            Ok(()) => state.completed = true,
            Err(e) => {
                state.failed = true;
                state.failure_reason = e.to_string();
            }
        }
    });
}
