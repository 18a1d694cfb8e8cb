//! Map and Read RPCs over a block export.

use super::extent::{ExtentMapBuilder, MapResponse, BASE_ALLOCATION, DIRTY_BITMAP_PREFIX};
use super::wire::MAX_DATA_PAYLOAD;
use super::{BlockExport, ExportConnector, ResponseSink};
use crate::utils::{Result, SupervisorError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest range asked of one block-status call
const MAX_STATUS_LENGTH: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRequest {
    pub export: String,
    /// Dirty bitmap (checkpoint) to map; base allocation when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<String>,
    pub offset: u64,
    /// Zero maps to the end of the export
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub export: String,
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub offset: u64,
    pub data: Bytes,
}

/// Clamp `length` to what remains of the export after `offset`.
pub fn clamp_length(offset: u64, length: u64, size: u64) -> Result<u64> {
    if offset >= size {
        return Err(SupervisorError::Protocol(format!(
            "offset {} is beyond export size {}",
            offset, size
        )));
    }
    let remaining = size - offset;
    if length == 0 || length > remaining {
        return Ok(remaining);
    }
    Ok(length)
}

/// Split `[offset, offset + length)` into `(offset, length)` chunks of at
/// most `chunk_size` bytes.
pub fn compute_chunks(offset: u64, length: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(length.div_ceil(chunk_size) as usize);
    let mut position = offset;
    let end = offset + length;
    while position < end {
        let len = chunk_size.min(end - position);
        chunks.push((position, len));
        position += len;
    }
    chunks
}

/// Prefix an export failure with the operation and offset it hit.
fn at_offset(operation: &str, offset: u64, error: SupervisorError) -> SupervisorError {
    match error {
        SupervisorError::Cancelled => SupervisorError::Cancelled,
        SupervisorError::Protocol(m) => {
            SupervisorError::Protocol(format!("{} at offset {}: {}", operation, offset, m))
        }
        other => SupervisorError::Transport(format!("{} at offset {}: {}", operation, offset, other)),
    }
}

pub struct ExportService {
    connector: Arc<dyn ExportConnector>,
    batch_size: usize,
    chunk_size: u64,
}

impl ExportService {
    pub fn new(connector: Arc<dyn ExportConnector>, batch_size: usize, chunk_size: u64) -> Self {
        let max_chunk = MAX_DATA_PAYLOAD as u64;
        if chunk_size > max_chunk {
            warn!("Read chunk size {} exceeds the frame limit, using {}", chunk_size, max_chunk);
        }
        Self {
            connector,
            batch_size,
            chunk_size: chunk_size.clamp(1, max_chunk),
        }
    }

    /// Stream the extent map of an export range.
    pub async fn map<S>(&self, request: &MapRequest, cancel: &CancellationToken, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        let context = match request.bitmap.as_deref().filter(|b| !b.is_empty()) {
            Some(bitmap) => format!("{}{}", DIRTY_BITMAP_PREFIX, bitmap),
            None => BASE_ALLOCATION.to_string(),
        };

        let mut export = self.connector.connect(&request.export, Some(context.as_str())).await?;
        let result = self.map_export(export.as_mut(), &context, request, cancel, sink).await;
        if let Err(e) = export.disconnect().await {
            debug!(export = %request.export, "Disconnect failed: {}", e);
        }
        result
    }

    async fn map_export<S>(
        &self,
        export: &mut dyn BlockExport,
        context: &str,
        request: &MapRequest,
        cancel: &CancellationToken,
        sink: &mut S,
    ) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        if !export.supports_context(context) {
            return Err(SupervisorError::Protocol(format!(
                "export {} does not support context {}",
                request.export, context
            )));
        }

        let length = clamp_length(request.offset, request.length, export.size())?;
        let end = request.offset + length;
        info!(export = %request.export, "Mapping {} [{}, {})", context, request.offset, end);

        let mut builder = ExtentMapBuilder::new(end, self.batch_size);
        let mut position = request.offset;
        while position < end {
            if cancel.is_cancelled() {
                return Err(SupervisorError::Cancelled);
            }

            let span = (end - position).min(MAX_STATUS_LENGTH) as u32;
            let statuses = export
                .block_status(position, span)
                .await
                .map_err(|e| at_offset("block status", position, e))?;

            let Some((_, entries)) = statuses.iter().find(|(name, _)| name.as_str() == context) else {
                return Err(SupervisorError::Protocol(format!(
                    "block status at offset {} has no {} entries",
                    position, context
                )));
            };

            let reached = builder.feed(context, position, entries, sink).await?;
            if reached <= position {
                return Err(SupervisorError::Protocol(format!(
                    "block status made no progress at offset {}",
                    position
                )));
            }
            position = reached;
        }

        builder.drain(sink).await
    }

    /// Stream the raw bytes of an export range in chunks.
    pub async fn read<S>(&self, request: &ReadRequest, cancel: &CancellationToken, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<DataChunk> + ?Sized,
    {
        let mut export = self.connector.connect(&request.export, None).await?;
        let result = self.read_export(export.as_mut(), request, cancel, sink).await;
        if let Err(e) = export.disconnect().await {
            debug!(export = %request.export, "Disconnect failed: {}", e);
        }
        result
    }

    async fn read_export<S>(
        &self,
        export: &mut dyn BlockExport,
        request: &ReadRequest,
        cancel: &CancellationToken,
        sink: &mut S,
    ) -> Result<()>
    where
        S: ResponseSink<DataChunk> + ?Sized,
    {
        let size = export.size();
        if size == 0 {
            warn!(export = %request.export, "Export reports zero size");
        }
        let length = clamp_length(request.offset, request.length, size)?;
        debug!(export = %request.export, "Reading {} bytes at {}", length, request.offset);

        for (offset, len) in compute_chunks(request.offset, length, self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(SupervisorError::Cancelled);
            }
            let data = export
                .read(offset, len as u32)
                .await
                .map_err(|e| at_offset("read", offset, e))?;
            sink.send(DataChunk { offset, data }).await?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MemoryConnector, MemoryExport};
    use super::*;

    fn service(export: MemoryExport, batch_size: usize, chunk_size: u64) -> ExportService {
        ExportService::new(Arc::new(MemoryConnector(export)), batch_size, chunk_size)
    }

    fn map_request(bitmap: Option<&str>, offset: u64, length: u64) -> MapRequest {
        MapRequest {
            export: "vda".to_string(),
            bitmap: bitmap.map(str::to_string),
            offset,
            length,
        }
    }

    #[test]
    fn test_clamp_length() {
        assert!(clamp_length(100, 10, 100).is_err());
        assert!(clamp_length(0, 10, 0).is_err());
        assert_eq!(clamp_length(10, 0, 100).unwrap(), 90);
        assert_eq!(clamp_length(10, 200, 100).unwrap(), 90);
        assert_eq!(clamp_length(10, 50, 100).unwrap(), 50);
    }

    #[test]
    fn test_compute_chunks() {
        let chunks = compute_chunks(100, 10_000, 4096);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (100, 4096));
        assert_eq!(chunks[2], (100 + 8192, 10_000 - 8192));
        assert_eq!(chunks.iter().map(|c| c.1).sum::<u64>(), 10_000);
        assert!(chunks.iter().all(|c| c.1 <= 4096));
        assert!(compute_chunks(0, 0, 4096).is_empty());
    }

    #[test]
    fn test_chunk_size_fits_a_data_frame() {
        let export = MemoryExport {
            size: 1024,
            ..Default::default()
        };
        assert_eq!(service(export.clone(), 16, u64::MAX).chunk_size, MAX_DATA_PAYLOAD as u64);
        assert_eq!(service(export.clone(), 16, 64 << 20).chunk_size, MAX_DATA_PAYLOAD as u64);
        assert_eq!(service(export.clone(), 16, 0).chunk_size, 1);
        assert_eq!(service(export, 16, 4096).chunk_size, 4096);
    }

    #[tokio::test]
    async fn test_map_base_allocation() {
        let export = MemoryExport {
            size: 1024,
            contexts: vec![BASE_ALLOCATION.to_string()],
            runs: vec![(0, 256, 0), (256, 256, 0), (512, 512, 3)],
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        service(export, 512, 4096)
            .map(&map_request(None, 0, 0), &CancellationToken::new(), &mut out)
            .await
            .unwrap();

        let extents: Vec<_> = out.iter().flat_map(|r| r.extents.clone()).collect();
        assert_eq!(extents.len(), 2);
        assert_eq!((extents[0].offset, extents[0].length), (0, 512));
        assert_eq!(extents[0].description, "data");
        assert_eq!(extents[1].description, "hole,zero");
    }

    #[tokio::test]
    async fn test_map_dirty_bitmap_in_several_calls() {
        let export = MemoryExport {
            size: 1 << 20,
            contexts: vec!["qemu:dirty-bitmap:cp1".to_string()],
            runs: vec![(0, 4096, 1), (4096, 4096, 0), (8192, (1 << 20) - 8192, 1)],
            max_descriptors: 1,
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        service(export, 1024, 4096)
            .map(&map_request(Some("cp1"), 0, 0), &CancellationToken::new(), &mut out)
            .await
            .unwrap();

        let extents: Vec<_> = out.iter().flat_map(|r| r.extents.clone()).collect();
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[2].end(), 1 << 20);
        assert_eq!(extents[1].description, "clean");
    }

    #[tokio::test]
    async fn test_unsupported_context_fails_fast() {
        let export = MemoryExport {
            size: 1024,
            contexts: vec![BASE_ALLOCATION.to_string()],
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        let err = service(export, 16, 4096)
            .map(&map_request(Some("cp1"), 0, 0), &CancellationToken::new(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Protocol(ref m) if m.contains("qemu:dirty-bitmap:cp1")));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_map_without_progress_fails() {
        let export = MemoryExport {
            size: 1024,
            contexts: vec![BASE_ALLOCATION.to_string()],
            stall: true,
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        let err = service(export, 16, 4096)
            .map(&map_request(None, 0, 0), &CancellationToken::new(), &mut out)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no progress"));
    }

    #[tokio::test]
    async fn test_map_transport_error_names_offset() {
        let export = MemoryExport {
            size: 8192,
            contexts: vec![BASE_ALLOCATION.to_string()],
            runs: vec![(0, 4096, 0), (4096, 4096, 1)],
            max_descriptors: 1,
            fail_status_at: Some(4096),
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        let err = service(export, 16, 4096)
            .map(&map_request(None, 0, 0), &CancellationToken::new(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Transport(ref m) if m.contains("offset 4096")));
    }

    #[tokio::test]
    async fn test_map_offset_beyond_size() {
        let export = MemoryExport {
            size: 1024,
            contexts: vec![BASE_ALLOCATION.to_string()],
            ..Default::default()
        };
        let mut out: Vec<MapResponse> = Vec::new();
        assert!(service(export, 16, 4096)
            .map(&map_request(None, 1024, 0), &CancellationToken::new(), &mut out)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_in_chunks() {
        let export = MemoryExport {
            size: 10_000,
            ..Default::default()
        };
        let reads = export.reads.clone();
        let mut out: Vec<DataChunk> = Vec::new();
        let request = ReadRequest {
            export: "vda".to_string(),
            offset: 1000,
            length: 0,
        };
        service(export, 16, 4096)
            .read(&request, &CancellationToken::new(), &mut out)
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(|c| c.data.len()).sum::<usize>(), 9000);
        assert_eq!(out[1].offset, 1000 + 4096);
        assert_eq!(reads.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let export = MemoryExport {
            size: 10_000,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out: Vec<DataChunk> = Vec::new();
        let request = ReadRequest {
            export: "vda".to_string(),
            offset: 0,
            length: 0,
        };
        let err = service(export, 16, 4096)
            .read(&request, &cancel, &mut out)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(out.is_empty());
    }
}
