//! Frame format of the export RPC protocol.
//!
//! Every frame is length-delimited. The first byte tags it: `0x01` for a
//! JSON control message, `0x02` for a binary data chunk
//! (`id:u64`, `offset:u64`, payload, big-endian).

use super::extent::MapResponse;
use super::service::{MapRequest, ReadRequest};
use crate::utils::{Result, SupervisorError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const MAX_FRAME_LENGTH: usize = 32 << 20;

const TAG_CONTROL: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const DATA_HEADER: usize = 16;

/// Largest payload a data frame can carry
pub const MAX_DATA_PAYLOAD: usize = MAX_FRAME_LENGTH - 1 - DATA_HEADER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Map(MapRequest),
    Read(ReadRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    /// Client call; responses carry the same id
    Request { id: u64, call: Call },
    Map { id: u64, response: MapResponse },
    End { id: u64 },
    Error { id: u64, kind: String, message: String },
    Cancel { id: u64 },
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(Control),
    Data { id: u64, offset: u64, data: Bytes },
}

pub struct ExportCodec {
    inner: LengthDelimitedCodec,
}

impl ExportCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for ExportCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ExportCodec {
    type Item = Frame;
    type Error = SupervisorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if frame.is_empty() {
            return Err(SupervisorError::Protocol("empty frame".to_string()));
        }

        match frame.get_u8() {
            TAG_CONTROL => Ok(Some(Frame::Control(serde_json::from_slice(&frame)?))),
            TAG_DATA => {
                if frame.len() < DATA_HEADER {
                    return Err(SupervisorError::Protocol(format!(
                        "data frame of {} bytes is shorter than its header",
                        frame.len()
                    )));
                }
                let id = frame.get_u64();
                let offset = frame.get_u64();
                Ok(Some(Frame::Data {
                    id,
                    offset,
                    data: frame.freeze(),
                }))
            }
            tag => Err(SupervisorError::Protocol(format!("unknown frame tag {:#04x}", tag))),
        }
    }
}

impl Encoder<Frame> for ExportCodec {
    type Error = SupervisorError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload = match frame {
            Frame::Control(control) => {
                let json = serde_json::to_vec(&control)?;
                let mut buf = BytesMut::with_capacity(1 + json.len());
                buf.put_u8(TAG_CONTROL);
                buf.put_slice(&json);
                buf
            }
            Frame::Data { id, offset, data } => {
                let mut buf = BytesMut::with_capacity(1 + DATA_HEADER + data.len());
                buf.put_u8(TAG_DATA);
                buf.put_u64(id);
                buf.put_u64(offset);
                buf.put_slice(&data);
                buf
            }
        };
        self.inner.encode(payload.freeze(), dst)?;
        Ok(())
    }
}
