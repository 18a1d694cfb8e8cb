//! Reconnecting tunnel that serves the export protocol to a remote
//! backup consumer.
//!
//! The manager dials out, serves the export RPC server on the single
//! resulting connection, and redials with capped, jittered backoff until
//! it is stopped or the local export socket disappears.

pub mod connect;
pub mod listener;
pub mod watch;

pub use connect::ConnectDialer;
pub use listener::{SingleConnListener, TrackedConn};
pub use watch::SocketWatch;

use crate::config::TunnelConfig;
use crate::export::{ExportServer, ExportService, ServerOption, ServerSettings};
use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch as state_watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Byte stream carrying the export protocol
pub trait TunnelConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelConn for T {}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn TunnelConn>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Connecting,
    Serving,
    Reconnecting,
}

/// Exponential backoff with jitter in `[base/2, base]`
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let half = base.as_millis() as u64 / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct TunnelManager {
    config: TunnelConfig,
    service: Arc<ExportService>,
    settings: ServerSettings,
    dialer: Arc<dyn Dialer>,
    state: Arc<state_watch::Sender<TunnelState>>,
    running: Mutex<Option<Running>>,
}

impl TunnelManager {
    /// `options` are applied in order on top of the configured keep-alive
    /// settings.
    pub fn new(
        config: TunnelConfig,
        service: Arc<ExportService>,
        options: Vec<ServerOption>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let settings = ServerSettings::from_config(&config).with_options(options);
        let (state, _) = state_watch::channel(TunnelState::Stopped);
        Self {
            config,
            service,
            settings,
            dialer,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> state_watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Start the tunnel in the background. A missing export socket is
    /// reported here and nothing is started.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Tunnel already running");
            return Ok(());
        }

        let watch = SocketWatch::new(&self.config.export_socket)?;
        let cancel = CancellationToken::new();
        let session = Session {
            config: self.config.clone(),
            service: self.service.clone(),
            settings: self.settings.clone(),
            dialer: self.dialer.clone(),
            state: self.state.clone(),
            cancel: cancel.clone(),
        };
        info!(address = %self.config.target_address, "Starting tunnel");
        let task = tokio::spawn(session.run(watch));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop the tunnel and wait for it to wind down.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("Tunnel task failed: {}", e);
        }
        self.state.send_replace(TunnelState::Stopped);
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

struct Session {
    config: TunnelConfig,
    service: Arc<ExportService>,
    settings: ServerSettings,
    dialer: Arc<dyn Dialer>,
    state: Arc<state_watch::Sender<TunnelState>>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, mut watch: SocketWatch) {
        let stop = self.cancel.child_token();
        let socket_gone = CancellationToken::new();

        let watcher = {
            let stop = stop.clone();
            let socket_gone = socket_gone.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = watch.removed() => {}
                }
                socket_gone.cancel();
                stop.cancel();
            })
        };

        self.retry(&stop).await;
        watcher.abort();

        if socket_gone.is_cancelled() {
            error!(
                "Tunnel stopped: export socket {} is gone",
                self.config.export_socket.display()
            );
        } else {
            info!("Tunnel stopped");
        }
        self.state.send_replace(TunnelState::Stopped);
    }

    async fn retry(&self, stop: &CancellationToken) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );

        loop {
            self.state.send_replace(TunnelState::Connecting);
            let started = Instant::now();
            match self.connect_and_serve(stop).await {
                Ok(()) => info!("Tunnel session ended"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(address = %self.config.target_address, "Tunnel session failed: {}", e),
            }
            if stop.is_cancelled() {
                return;
            }

            if started.elapsed() >= self.config.stable_period() {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            self.state.send_replace(TunnelState::Reconnecting);
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_serve(&self, stop: &CancellationToken) -> Result<()> {
        let dial_timeout = self.config.dial_timeout();
        let conn = tokio::select! {
            _ = stop.cancelled() => return Err(SupervisorError::Cancelled),
            dialed = tokio::time::timeout(dial_timeout, self.dialer.dial()) => {
                dialed.map_err(|_| SupervisorError::Timeout(format!(
                    "dialing {} took longer than {:?}",
                    self.config.target_address, dial_timeout
                )))??
            }
        };

        self.state.send_replace(TunnelState::Serving);
        info!(address = %self.config.target_address, "Tunnel established");

        let server = ExportServer::new(self.service.clone(), self.settings.clone());
        let handle = server.handle();
        let done = CancellationToken::new();

        let grace = self.config.graceful_shutdown();
        let supervisor = {
            let stop = stop.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = stop.cancelled() => {}
                }
                handle.graceful_stop();
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tokio::time::sleep(grace) => {
                        warn!("Graceful stop did not finish in {:?}, forcing", grace);
                        handle.stop();
                    }
                }
            })
        };

        // Boxed as a `Send` trait object so the spawned session future is
        // provably `Send` (works around a higher-ranked lifetime inference limit).
        let serving: Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> =
            Box::pin(server.serve(SingleConnListener::new(conn)));
        let result = serving.await;
        done.cancel();
        let _ = supervisor.await;
        result
    }
}
