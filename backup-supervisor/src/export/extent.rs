//! Extent coalescing and batching for the Map RPC.

use super::ResponseSink;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const BASE_ALLOCATION: &str = "base:allocation";
pub const DIRTY_BITMAP_PREFIX: &str = "qemu:dirty-bitmap:";

/// `base:allocation` flags
pub const STATE_HOLE: u32 = 1;
pub const STATE_ZERO: u32 = 2;
/// Dirty bitmap flag
pub const STATE_DIRTY: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
    pub description: String,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One batch of extents; scanning resumes at `next_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapResponse {
    pub extents: Vec<Extent>,
    pub next_offset: u64,
}

/// Block status descriptor as returned by the export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub length: u64,
    pub flags: u32,
}

impl RawExtent {
    pub fn new(length: u64, flags: u32) -> Self {
        Self { length, flags }
    }
}

/// Human-readable meaning of `flags` in `context`
pub fn describe(context: &str, flags: u32) -> String {
    if context == BASE_ALLOCATION {
        let hole = flags & STATE_HOLE != 0;
        let zero = flags & STATE_ZERO != 0;
        return match (hole, zero) {
            (false, false) => "data",
            (true, false) => "hole",
            (false, true) => "zero",
            (true, true) => "hole,zero",
        }
        .to_string();
    }
    if context.starts_with(DIRTY_BITMAP_PREFIX) {
        return if flags & STATE_DIRTY != 0 { "dirty" } else { "clean" }.to_string();
    }
    format!("flags={:#x}", flags)
}

pub struct ExtentMapBuilder {
    end_offset: u64,
    batch_size: usize,
    /// Extent still growing, per context
    open: HashMap<String, Extent>,
    pending: Vec<Extent>,
}

impl ExtentMapBuilder {
    pub fn new(end_offset: u64, batch_size: usize) -> Self {
        Self {
            end_offset,
            batch_size: batch_size.max(1),
            open: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Feed descriptors covering `[offset, ..)` for `context`.
    ///
    /// Returns the furthest offset reached, clipped to the end offset.
    pub async fn feed<S>(&mut self, context: &str, offset: u64, entries: &[RawExtent], sink: &mut S) -> Result<u64>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        let mut position = offset;
        for entry in entries {
            if position >= self.end_offset {
                break;
            }
            let length = entry.length.min(self.end_offset - position);
            if length == 0 {
                continue;
            }
            self.add(context, position, length, entry.flags, sink).await?;
            position += length;
        }
        Ok(position)
    }

    async fn add<S>(&mut self, context: &str, offset: u64, length: u64, flags: u32, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        if let Some(open) = self.open.get_mut(context) {
            if open.flags == flags && open.end() == offset {
                open.length += length;
                return Ok(());
            }
        }

        let extent = Extent {
            offset,
            length,
            flags,
            description: describe(context, flags),
        };
        if let Some(previous) = self.open.insert(context.to_string(), extent) {
            self.push(previous, sink).await?;
        }
        Ok(())
    }

    async fn push<S>(&mut self, extent: Extent, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        self.pending.push(extent);
        if self.pending.len() >= self.batch_size {
            self.flush(sink).await?;
        }
        Ok(())
    }

    async fn flush<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        let Some(last) = self.pending.last() else {
            return Ok(());
        };
        let next_offset = last.end();
        let extents = std::mem::take(&mut self.pending);
        sink.send(MapResponse { extents, next_offset }).await
    }

    /// Flush every open extent in ascending offset order, then the last
    /// partial batch.
    pub async fn drain<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: ResponseSink<MapResponse> + ?Sized,
    {
        let mut open: Vec<Extent> = self.open.drain().map(|(_, extent)| extent).collect();
        open.sort_by_key(|e| e.offset);
        for extent in open {
            self.push(extent, sink).await?;
        }
        self.flush(sink).await
    }
}
