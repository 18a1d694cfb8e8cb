//! Block export RPC surface.
//!
//! `ExportService` answers Map and Read calls from a block export; the
//! server carries those calls over a length-delimited frame protocol.

pub mod extent;
pub mod nbd;
pub mod server;
pub mod service;
pub mod wire;

pub use extent::{Extent, ExtentMapBuilder, MapResponse, RawExtent};
pub use server::{ExportServer, Listener, ServerHandle, ServerOption, ServerSettings};
pub use service::{clamp_length, compute_chunks, DataChunk, ExportService, MapRequest, ReadRequest};

use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Receiving end of a streaming RPC
#[async_trait]
pub trait ResponseSink<T: Send + 'static>: Send {
    async fn send(&mut self, item: T) -> Result<()>;
}

#[async_trait]
impl<T: Send + 'static> ResponseSink<T> for mpsc::Sender<T> {
    async fn send(&mut self, item: T) -> Result<()> {
        mpsc::Sender::send(self, item)
            .await
            .map_err(|_| SupervisorError::Cancelled)
    }
}

#[async_trait]
impl<T: Send + 'static> ResponseSink<T> for Vec<T> {
    async fn send(&mut self, item: T) -> Result<()> {
        self.push(item);
        Ok(())
    }
}

/// One open connection to a block export
#[async_trait]
pub trait BlockExport: Send {
    /// Export size in bytes
    fn size(&self) -> u64;

    /// Whether the server agreed to report `context`
    fn supports_context(&self, context: &str) -> bool;

    /// Block status of `[offset, offset + length)`, per negotiated context
    async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<(String, Vec<RawExtent>)>>;

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Opens a fresh export connection per RPC call
#[async_trait]
pub trait ExportConnector: Send + Sync {
    async fn connect(&self, export_name: &str, meta_context: Option<&str>) -> Result<Box<dyn BlockExport>>;
}
