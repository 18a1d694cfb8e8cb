//! Fixed-newstyle NBD client.
//!
//! Negotiates structured replies and meta contexts, then issues block
//! status and read commands one at a time.

use super::extent::RawExtent;
use super::{BlockExport, ExportConnector};
use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, warn};

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943;
const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const REQUEST_MAGIC: u32 = 0x2560_9513;
const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_NO_ZEROES: u16 = 1 << 1;

const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;
const OPT_SET_META_CONTEXT: u32 = 10;

const REP_ACK: u32 = 1;
const REP_INFO: u32 = 3;
const REP_META_CONTEXT: u32 = 4;
const REP_FLAG_ERROR: u32 = 1 << 31;

const INFO_EXPORT: u16 = 0;

const CMD_READ: u16 = 0;
const CMD_DISC: u16 = 2;
const CMD_BLOCK_STATUS: u16 = 7;

const REPLY_FLAG_DONE: u16 = 1 << 0;
const REPLY_TYPE_NONE: u16 = 0;
const REPLY_TYPE_OFFSET_DATA: u16 = 1;
const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const REPLY_TYPE_ERROR: u16 = 32769;
const REPLY_TYPE_ERROR_OFFSET: u16 = 32770;

const MAX_OPTION_REPLY: u32 = 1 << 20;
const MAX_CHUNK: u32 = 64 << 20;

fn protocol(message: impl Into<String>) -> SupervisorError {
    SupervisorError::Protocol(message.into())
}

struct OptionReply {
    reply_type: u32,
    data: Bytes,
}

impl OptionReply {
    fn is_error(&self) -> bool {
        self.reply_type & REP_FLAG_ERROR != 0
    }

    fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

enum Chunk {
    /// Simple reply header; read payload follows when `error` is zero
    Simple { error: u32 },
    Structured { done: bool, kind: u16, payload: Bytes },
}

/// Error carried by an `ERROR`/`ERROR_OFFSET` chunk
fn chunk_error(mut payload: Bytes) -> SupervisorError {
    if payload.len() < 6 {
        return protocol("truncated error chunk");
    }
    let errno = payload.get_u32();
    let len = (payload.get_u16() as usize).min(payload.len());
    let message = String::from_utf8_lossy(&payload[..len]).into_owned();
    SupervisorError::Io(std::io::Error::other(format!("NBD error {}: {}", errno, message)))
}

pub struct NbdClient<S> {
    stream: S,
    size: u64,
    structured: bool,
    /// Negotiated meta contexts by id
    contexts: HashMap<u32, String>,
    cookie: u64,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake for `export`, asking for `meta_contexts`.
    pub async fn handshake(mut stream: S, export: &str, meta_contexts: &[&str]) -> Result<Self> {
        if stream.read_u64().await? != NBD_MAGIC {
            return Err(protocol("bad NBD magic"));
        }
        if stream.read_u64().await? != IHAVEOPT {
            return Err(protocol("server does not speak newstyle negotiation"));
        }
        let server_flags = stream.read_u16().await?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(protocol("server does not support fixed newstyle"));
        }
        let client_flags = (FLAG_FIXED_NEWSTYLE | (server_flags & FLAG_NO_ZEROES)) as u32;
        stream.write_u32(client_flags).await?;

        let mut client = Self {
            stream,
            size: 0,
            structured: false,
            contexts: HashMap::new(),
            cookie: 0,
        };
        client.structured = client.negotiate_structured_replies().await?;
        if client.structured && !meta_contexts.is_empty() {
            client.negotiate_meta_contexts(export, meta_contexts).await?;
        }
        client.go(export).await?;
        debug!(export = %export, "NBD export open, size {}", client.size);
        Ok(client)
    }

    async fn send_option(&mut self, option: u32, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(16 + data.len());
        buf.put_u64(IHAVEOPT);
        buf.put_u32(option);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_option_reply(&mut self, option: u32) -> Result<OptionReply> {
        if self.stream.read_u64().await? != OPTION_REPLY_MAGIC {
            return Err(protocol("bad option reply magic"));
        }
        let replied = self.stream.read_u32().await?;
        if replied != option {
            return Err(protocol(format!("reply for option {} while negotiating {}", replied, option)));
        }
        let reply_type = self.stream.read_u32().await?;
        let length = self.stream.read_u32().await?;
        if length > MAX_OPTION_REPLY {
            return Err(protocol(format!("option reply of {} bytes", length)));
        }
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).await?;
        Ok(OptionReply {
            reply_type,
            data: Bytes::from(data),
        })
    }

    async fn negotiate_structured_replies(&mut self) -> Result<bool> {
        self.send_option(OPT_STRUCTURED_REPLY, &[]).await?;
        let reply = self.read_option_reply(OPT_STRUCTURED_REPLY).await?;
        match reply.reply_type {
            REP_ACK => Ok(true),
            _ if reply.is_error() => {
                debug!("Server refused structured replies: {}", reply.message());
                Ok(false)
            }
            other => Err(protocol(format!("unexpected structured reply answer {}", other))),
        }
    }

    async fn negotiate_meta_contexts(&mut self, export: &str, queries: &[&str]) -> Result<()> {
        let mut data = BytesMut::new();
        data.put_u32(export.len() as u32);
        data.put_slice(export.as_bytes());
        data.put_u32(queries.len() as u32);
        for query in queries {
            data.put_u32(query.len() as u32);
            data.put_slice(query.as_bytes());
        }
        self.send_option(OPT_SET_META_CONTEXT, &data).await?;

        loop {
            let mut reply = self.read_option_reply(OPT_SET_META_CONTEXT).await?;
            match reply.reply_type {
                REP_META_CONTEXT => {
                    if reply.data.len() < 4 {
                        return Err(protocol("truncated meta context reply"));
                    }
                    let id = reply.data.get_u32();
                    let name = String::from_utf8_lossy(&reply.data).into_owned();
                    debug!("Meta context {} -> {}", name, id);
                    self.contexts.insert(id, name);
                }
                REP_ACK => return Ok(()),
                _ if reply.is_error() => {
                    warn!("Server rejected meta contexts {:?}: {}", queries, reply.message());
                    return Ok(());
                }
                other => return Err(protocol(format!("unexpected meta context reply {}", other))),
            }
        }
    }

    async fn go(&mut self, export: &str) -> Result<()> {
        let mut data = BytesMut::new();
        data.put_u32(export.len() as u32);
        data.put_slice(export.as_bytes());
        data.put_u16(0);
        self.send_option(OPT_GO, &data).await?;

        loop {
            let mut reply = self.read_option_reply(OPT_GO).await?;
            match reply.reply_type {
                REP_INFO => {
                    if reply.data.len() >= 12 && reply.data.get_u16() == INFO_EXPORT {
                        self.size = reply.data.get_u64();
                    }
                }
                REP_ACK => return Ok(()),
                _ if reply.is_error() => {
                    return Err(SupervisorError::NotFound(format!(
                        "export {} unavailable: {}",
                        export,
                        reply.message()
                    )));
                }
                other => return Err(protocol(format!("unexpected go reply {}", other))),
            }
        }
    }

    async fn send_request(&mut self, command: u16, offset: u64, length: u32) -> Result<u64> {
        self.cookie += 1;
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u32(REQUEST_MAGIC);
        buf.put_u16(0);
        buf.put_u16(command);
        buf.put_u64(self.cookie);
        buf.put_u64(offset);
        buf.put_u32(length);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(self.cookie)
    }

    async fn read_chunk(&mut self, cookie: u64) -> Result<Chunk> {
        let magic = self.stream.read_u32().await?;
        if magic == SIMPLE_REPLY_MAGIC {
            let error = self.stream.read_u32().await?;
            if self.stream.read_u64().await? != cookie {
                return Err(protocol("reply for unknown request"));
            }
            return Ok(Chunk::Simple { error });
        }
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(protocol(format!("bad reply magic {:#x}", magic)));
        }

        let flags = self.stream.read_u16().await?;
        let kind = self.stream.read_u16().await?;
        if self.stream.read_u64().await? != cookie {
            return Err(protocol("reply for unknown request"));
        }
        let length = self.stream.read_u32().await?;
        if length > MAX_CHUNK {
            return Err(protocol(format!("reply chunk of {} bytes", length)));
        }
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(Chunk::Structured {
            done: flags & REPLY_FLAG_DONE != 0,
            kind,
            payload: Bytes::from(payload),
        })
    }

    pub async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<(String, Vec<RawExtent>)>> {
        if self.contexts.is_empty() {
            return Err(protocol("no meta context negotiated"));
        }
        let cookie = self.send_request(CMD_BLOCK_STATUS, offset, length).await?;

        let mut statuses = Vec::new();
        let mut failure = None;
        loop {
            match self.read_chunk(cookie).await? {
                Chunk::Simple { error } => {
                    if error == 0 {
                        return Err(protocol("simple reply to block status"));
                    }
                    return Err(SupervisorError::Io(std::io::Error::other(format!(
                        "block status failed with NBD error {}",
                        error
                    ))));
                }
                Chunk::Structured { done, kind, mut payload } => {
                    match kind {
                        REPLY_TYPE_BLOCK_STATUS => {
                            if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
                                return Err(protocol(format!("malformed block status of {} bytes", payload.len())));
                            }
                            let id = payload.get_u32();
                            let Some(name) = self.contexts.get(&id) else {
                                return Err(protocol(format!("block status for unknown context {}", id)));
                            };
                            let mut entries = Vec::with_capacity(payload.len() / 8);
                            while payload.remaining() >= 8 {
                                let len = payload.get_u32() as u64;
                                let flags = payload.get_u32();
                                entries.push(RawExtent::new(len, flags));
                            }
                            statuses.push((name.clone(), entries));
                        }
                        REPLY_TYPE_ERROR | REPLY_TYPE_ERROR_OFFSET => failure = Some(chunk_error(payload)),
                        REPLY_TYPE_NONE => {}
                        other => return Err(protocol(format!("unexpected reply type {} to block status", other))),
                    }
                    if done {
                        break;
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        let cookie = self.send_request(CMD_READ, offset, length).await?;
        // Holes are left zeroed
        let mut buf = vec![0u8; length as usize];
        let mut failure = None;

        loop {
            match self.read_chunk(cookie).await? {
                Chunk::Simple { error } => {
                    if error != 0 {
                        return Err(SupervisorError::Io(std::io::Error::other(format!(
                            "read failed with NBD error {}",
                            error
                        ))));
                    }
                    self.stream.read_exact(&mut buf).await?;
                    return Ok(Bytes::from(buf));
                }
                Chunk::Structured { done, kind, mut payload } => {
                    match kind {
                        REPLY_TYPE_OFFSET_DATA => {
                            if payload.len() < 8 {
                                return Err(protocol("truncated data chunk"));
                            }
                            let start = chunk_start(payload.get_u64(), offset, payload.len() as u64, length)?;
                            buf[start..start + payload.len()].copy_from_slice(&payload);
                        }
                        REPLY_TYPE_OFFSET_HOLE => {
                            if payload.len() != 12 {
                                return Err(protocol("malformed hole chunk"));
                            }
                            let chunk_offset = payload.get_u64();
                            let hole = payload.get_u32() as u64;
                            chunk_start(chunk_offset, offset, hole, length)?;
                        }
                        REPLY_TYPE_ERROR | REPLY_TYPE_ERROR_OFFSET => failure = Some(chunk_error(payload)),
                        REPLY_TYPE_NONE => {}
                        other => return Err(protocol(format!("unexpected reply type {} to read", other))),
                    }
                    if done {
                        break;
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(Bytes::from(buf)),
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.send_request(CMD_DISC, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Position of a reply chunk inside the read buffer
fn chunk_start(chunk_offset: u64, offset: u64, chunk_length: u64, length: u32) -> Result<usize> {
    let start = chunk_offset
        .checked_sub(offset)
        .filter(|start| start + chunk_length <= length as u64)
        .ok_or_else(|| protocol(format!("reply chunk at {} outside the request", chunk_offset)))?;
    Ok(start as usize)
}

#[async_trait]
impl<S> BlockExport for NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn size(&self) -> u64 {
        self.size
    }

    fn supports_context(&self, context: &str) -> bool {
        self.contexts.values().any(|c| c == context)
    }

    async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<(String, Vec<RawExtent>)>> {
        NbdClient::block_status(self, offset, length).await
    }

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        NbdClient::read(self, offset, length).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        NbdClient::disconnect(self).await
    }
}

/// Connects to the hypervisor's NBD server on a Unix socket
pub struct NbdConnector {
    socket: PathBuf,
}

impl NbdConnector {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into() }
    }
}

#[async_trait]
impl ExportConnector for NbdConnector {
    async fn connect(&self, export_name: &str, meta_context: Option<&str>) -> Result<Box<dyn BlockExport>> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            SupervisorError::Transport(format!("connect {}: {}", self.socket.display(), e))
        })?;
        let contexts: Vec<&str> = meta_context.into_iter().collect();
        let client = NbdClient::handshake(stream, export_name, &contexts).await?;
        Ok(Box::new(client))
    }
}
