//! Export socket removal watch.

use crate::utils::{Result, SupervisorError};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Existence check period once file events are unavailable
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct SocketWatch {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    poll_interval: Duration,
}

impl SocketWatch {
    /// Start watching `path`. Fails with `NotFound` when it does not exist.
    pub fn new(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SupervisorError::NotFound(format!(
                "export socket {} does not exist",
                path.display()
            )));
        }

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path: path.to_path_buf(),
            _watcher: watcher,
            events,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Resolves once the socket has been removed or renamed away.
    ///
    /// A failing watcher is not a removal: the socket is polled instead.
    pub async fn removed(&mut self) {
        if let Err(e) = self.next_removal_event().await {
            warn!(
                "Watch on export socket {} failed, polling instead: {}",
                self.path.display(),
                e
            );
            self.poll_removed().await;
        }
    }

    async fn next_removal_event(&mut self) -> Result<()> {
        loop {
            let event = match self.events.recv().await {
                Some(event) => event?,
                None => return Err(SupervisorError::Io(std::io::Error::other("socket watcher stopped"))),
            };

            let ours = event.paths.iter().any(|p| p.file_name() == self.path.file_name());
            let gone = matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)));
            if ours && gone && !self.path.exists() {
                debug!("Socket {} gone ({:?})", self.path.display(), event.kind);
                return Ok(());
            }
        }
    }

    async fn poll_removed(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if !self.path.exists() {
                debug!("Socket {} gone (polled)", self.path.display());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = SocketWatch::new(&dir.path().join("nbd.sock")).err().unwrap();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_removal_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        std::fs::write(&socket, b"").unwrap();
        let mut watch = SocketWatch::new(&socket).unwrap();

        std::fs::write(dir.path().join("other"), b"").unwrap();
        std::fs::remove_file(&socket).unwrap();

        tokio::time::timeout(Duration::from_secs(5), watch.removed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_watcher_falls_back_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        std::fs::write(&socket, b"").unwrap();
        let mut watch = SocketWatch::new(&socket).unwrap();
        watch.poll_interval = Duration::from_millis(20);
        let (_, closed) = mpsc::unbounded_channel();
        watch.events = closed;

        // Still present: the failed watcher alone must not report removal
        assert!(tokio::time::timeout(Duration::from_millis(200), watch.removed())
            .await
            .is_err());

        std::fs::remove_file(&socket).unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch.removed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_error_falls_back_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nbd.sock");
        std::fs::write(&socket, b"").unwrap();
        let mut watch = SocketWatch::new(&socket).unwrap();
        watch.poll_interval = Duration::from_millis(20);
        let (tx, events) = mpsc::unbounded_channel();
        tx.send(Err(notify::Error::generic("inotify queue overflow"))).unwrap();
        watch.events = events;

        let removal = tokio::spawn(async move { watch.removed().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!removal.is_finished());

        std::fs::remove_file(&socket).unwrap();
        tokio::time::timeout(Duration::from_secs(5), removal)
            .await
            .unwrap()
            .unwrap();
        drop(tx);
    }
}
