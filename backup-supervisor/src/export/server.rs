//! RPC server for the export protocol.
//!
//! Each accepted connection multiplexes calls by request id. Responses
//! are funneled through a single writer task; every call ends with an
//! `end` or `error` frame.

use super::extent::MapResponse;
use super::service::{DataChunk, ExportService};
use super::wire::{Call, Control, ExportCodec, Frame};
use super::ResponseSink;
use crate::config::TunnelConfig;
use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 64;

/// Keep-alive enforcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Client pings closer together than this count as strikes
    pub min_ping_interval: Duration,
    pub max_ping_strikes: u32,
}

impl ServerSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(config.keepalive_timeout_secs),
            min_ping_interval: Duration::from_secs(config.min_ping_interval_secs),
            max_ping_strikes: 3,
        }
    }

    /// Apply `options` in order.
    pub fn with_options(mut self, options: Vec<ServerOption>) -> Self {
        for option in options {
            option(&mut self);
        }
        self
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}

/// Adjusts server settings at construction
pub type ServerOption = Box<dyn FnOnce(&mut ServerSettings) + Send>;

/// Source of connections for `ExportServer::serve`
#[async_trait]
pub trait Listener: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// `SupervisorError::ListenerClosed` ends the accept loop cleanly.
    async fn accept(&mut self) -> Result<Self::Conn>;
}

#[derive(Clone, Default)]
pub struct ServerHandle {
    graceful: CancellationToken,
    force: CancellationToken,
}

impl ServerHandle {
    /// Stop accepting connections and requests; let in-flight calls finish.
    pub fn graceful_stop(&self) {
        self.graceful.cancel();
    }

    /// Cancel everything, including in-flight calls.
    pub fn stop(&self) {
        self.graceful.cancel();
        self.force.cancel();
    }
}

pub struct ExportServer {
    service: Arc<ExportService>,
    settings: ServerSettings,
    handle: ServerHandle,
}

impl ExportServer {
    pub fn new(service: Arc<ExportService>, settings: ServerSettings) -> Self {
        Self {
            service,
            settings,
            handle: ServerHandle::default(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept and serve connections until the listener closes or the
    /// server is stopped.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        let tracker = TaskTracker::new();

        let result = loop {
            let accepted = tokio::select! {
                _ = self.handle.graceful.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let connection = Connection {
                        service: self.service.clone(),
                        settings: self.settings.clone(),
                        handle: self.handle.clone(),
                        calls: Arc::new(DashMap::new()),
                        tracker: TaskTracker::new(),
                    };
                    tracker.spawn(async move {
                        if let Err(e) = connection.run(conn).await {
                            warn!("Export connection closed: {}", e);
                        }
                    });
                }
                Err(SupervisorError::ListenerClosed) => {
                    debug!("Listener closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        tracker.close();
        tracker.wait().await;
        result
    }
}

struct Connection {
    service: Arc<ExportService>,
    settings: ServerSettings,
    handle: ServerHandle,
    /// In-flight calls by request id
    calls: Arc<DashMap<u64, CancellationToken>>,
    tracker: TaskTracker,
}

impl Connection {
    async fn run<C>(self, conn: C) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = Framed::new(conn, ExportCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);

        let force = self.handle.force.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = force.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                sink.send(frame).await?;
            }
            sink.close().await
        });

        let interval = self.settings.keepalive_interval;
        let idle_limit = interval + self.settings.keepalive_timeout;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_seen = Instant::now();
        let mut last_ping: Option<Instant> = None;
        let mut strikes = 0u32;

        let outcome = loop {
            tokio::select! {
                _ = self.handle.graceful.cancelled() => break Ok(()),
                _ = keepalive.tick() => {
                    if last_seen.elapsed() >= idle_limit {
                        break Err(SupervisorError::Timeout(format!(
                            "peer silent for {:?}",
                            last_seen.elapsed()
                        )));
                    }
                    if tx.send(Frame::Control(Control::Ping)).await.is_err() {
                        break Ok(());
                    }
                }
                frame = stream.next() => {
                    let frame = match frame {
                        None => break Ok(()),
                        Some(Err(e)) => break Err(e),
                        Some(Ok(frame)) => frame,
                    };
                    last_seen = Instant::now();

                    match frame {
                        Frame::Control(Control::Request { id, call }) => self.start_call(id, call, &tx).await,
                        Frame::Control(Control::Cancel { id }) => {
                            if let Some(token) = self.calls.get(&id) {
                                debug!("Cancelling call {}", id);
                                token.cancel();
                            }
                        }
                        Frame::Control(Control::Ping) => {
                            let too_soon = last_ping
                                .is_some_and(|previous| previous.elapsed() < self.settings.min_ping_interval);
                            strikes = if too_soon { strikes + 1 } else { 0 };
                            last_ping = Some(Instant::now());
                            if strikes > self.settings.max_ping_strikes {
                                break Err(SupervisorError::Protocol("client pings too often".to_string()));
                            }
                            if tx.send(Frame::Control(Control::Pong)).await.is_err() {
                                break Ok(());
                            }
                        }
                        Frame::Control(Control::Pong) => {}
                        other => {
                            break Err(SupervisorError::Protocol(format!("unexpected frame from client: {:?}", other)));
                        }
                    }
                }
            }
        };
        drop(stream);

        if !self.handle.graceful.is_cancelled() {
            // Nobody is left to read the responses
            for call in self.calls.iter() {
                call.cancel();
            }
        } else if !self.calls.is_empty() {
            info!("Waiting for {} in-flight calls", self.calls.len());
        }
        self.tracker.close();
        self.tracker.wait().await;

        drop(tx);
        match writer.await {
            Ok(Err(e)) => debug!("Writer stopped: {}", e),
            Err(e) => warn!("Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
        outcome
    }

    async fn start_call(&self, id: u64, call: Call, tx: &mpsc::Sender<Frame>) {
        if self.calls.contains_key(&id) {
            let duplicate = Control::Error {
                id,
                kind: "conflict".to_string(),
                message: format!("request id {} is already in flight", id),
            };
            let _ = tx.send(Frame::Control(duplicate)).await;
            return;
        }

        let token = self.handle.force.child_token();
        self.calls.insert(id, token.clone());

        let service = self.service.clone();
        let calls = self.calls.clone();
        let tx = tx.clone();
        self.tracker.spawn(async move {
            let mut sink = FrameSink { id, tx: tx.clone() };
            let result = match call {
                Call::Map(request) => until_cancelled(&token, service.map(&request, &token, &mut sink)).await,
                Call::Read(request) => until_cancelled(&token, service.read(&request, &token, &mut sink)).await,
            };

            let terminal = match result {
                Ok(()) => Control::End { id },
                Err(e) => {
                    if e.is_cancelled() {
                        debug!("Call {} cancelled", id);
                    } else {
                        warn!("Call {} failed: {}", id, e);
                    }
                    Control::Error {
                        id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }
                }
            };
            calls.remove(&id);
            let _ = tx.send(Frame::Control(terminal)).await;
        });
    }
}

async fn until_cancelled<F>(token: &CancellationToken, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = call => result,
        _ = token.cancelled() => Err(SupervisorError::Cancelled),
    }
}

/// Routes one call's responses onto the connection
struct FrameSink {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    async fn push(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| SupervisorError::Cancelled)
    }
}

#[async_trait]
impl ResponseSink<MapResponse> for FrameSink {
    async fn send(&mut self, response: MapResponse) -> Result<()> {
        self.push(Frame::Control(Control::Map { id: self.id, response })).await
    }
}

#[async_trait]
impl ResponseSink<DataChunk> for FrameSink {
    async fn send(&mut self, chunk: DataChunk) -> Result<()> {
        self.push(Frame::Data {
            id: self.id,
            offset: chunk.offset,
            data: chunk.data,
        })
        .await
    }
}
