//! Export RPC server driven end-to-end over an in-memory connection.

use async_trait::async_trait;
use backup_supervisor::export::extent::{RawExtent, DIRTY_BITMAP_PREFIX};
use backup_supervisor::export::wire::{Call, Control, ExportCodec, Frame};
use backup_supervisor::export::{
    BlockExport, ExportConnector, ExportServer, ExportService, MapRequest, ReadRequest, ServerSettings,
};
use backup_supervisor::tunnel::SingleConnListener;
use backup_supervisor::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

const SIZE: u64 = 64 * 1024;
const BITMAP: &str = "backup-1";

/// Every other 4 KiB block is dirty; reads return the block index.
struct StripedExport {
    read_delay: Duration,
}

#[async_trait]
impl BlockExport for StripedExport {
    fn size(&self) -> u64 {
        SIZE
    }

    fn supports_context(&self, context: &str) -> bool {
        context == format!("{}{}", DIRTY_BITMAP_PREFIX, BITMAP)
    }

    async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<(String, Vec<RawExtent>)>> {
        let mut entries = Vec::new();
        let mut position = offset;
        let end = offset + length as u64;
        while position < end {
            let block_end = (position / 4096 + 1) * 4096;
            let len = block_end.min(end) - position;
            entries.push(RawExtent::new(len, ((position / 4096) % 2 == 0) as u32));
            position += len;
        }
        Ok(vec![(format!("{}{}", DIRTY_BITMAP_PREFIX, BITMAP), entries)])
    }

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        tokio::time::sleep(self.read_delay).await;
        Ok(Bytes::from(vec![(offset / 4096) as u8; length as usize]))
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

struct StripedConnector {
    read_delay: Duration,
}

#[async_trait]
impl ExportConnector for StripedConnector {
    async fn connect(&self, _export_name: &str, _meta_context: Option<&str>) -> Result<Box<dyn BlockExport>> {
        Ok(Box::new(StripedExport {
            read_delay: self.read_delay,
        }))
    }
}

struct Harness {
    client: Framed<DuplexStream, ExportCodec>,
    server: tokio::task::JoinHandle<Result<()>>,
}

fn serve(read_delay: Duration) -> Harness {
    let service = Arc::new(ExportService::new(Arc::new(StripedConnector { read_delay }), 4, 8192));
    let server = ExportServer::new(service, ServerSettings::default());
    let (client, conn) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move { server.serve(SingleConnListener::new(conn)).await });
    Harness {
        client: Framed::new(client, ExportCodec::new()),
        server,
    }
}

async fn next(client: &mut Framed<DuplexStream, ExportCodec>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("server response")
        .expect("open connection")
        .expect("valid frame")
}

#[tokio::test]
async fn map_streams_batches_until_end() {
    let mut h = serve(Duration::ZERO);
    let call = Call::Map(MapRequest {
        export: "vda".to_string(),
        bitmap: Some(BITMAP.to_string()),
        offset: 0,
        length: 0,
    });
    h.client
        .send(Frame::Control(Control::Request { id: 1, call }))
        .await
        .unwrap();

    let mut extents = Vec::new();
    let mut batches = 0;
    loop {
        match next(&mut h.client).await {
            Frame::Control(Control::Map { id: 1, response }) => {
                assert!(response.extents.len() <= 4);
                assert_eq!(response.next_offset, response.extents.last().unwrap().end());
                extents.extend(response.extents);
                batches += 1;
            }
            Frame::Control(Control::End { id: 1 }) => break,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    assert_eq!(extents.len(), 16);
    assert_eq!(batches, 4);
    assert_eq!(extents[0].description, "dirty");
    assert_eq!(extents[1].description, "clean");
    for pair in extents.windows(2) {
        assert_eq!(pair[0].end(), pair[1].offset);
    }
    assert_eq!(extents.last().unwrap().end(), SIZE);

    drop(h.client);
    h.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_calls_share_the_connection() {
    let mut h = serve(Duration::ZERO);
    let map = Call::Map(MapRequest {
        export: "vda".to_string(),
        bitmap: Some(BITMAP.to_string()),
        offset: 0,
        length: 8192,
    });
    let read = Call::Read(ReadRequest {
        export: "vda".to_string(),
        offset: 4096,
        length: 16384,
    });
    h.client
        .send(Frame::Control(Control::Request { id: 1, call: map }))
        .await
        .unwrap();
    h.client
        .send(Frame::Control(Control::Request { id: 2, call: read }))
        .await
        .unwrap();

    let mut ended = Vec::new();
    let mut read_bytes = 0;
    while ended.len() < 2 {
        match next(&mut h.client).await {
            Frame::Control(Control::End { id }) => ended.push(id),
            Frame::Control(Control::Map { id, .. }) => assert_eq!(id, 1),
            Frame::Data { id, offset, data } => {
                assert_eq!(id, 2);
                assert_eq!(data[0], (offset / 4096) as u8);
                read_bytes += data.len();
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    ended.sort();
    assert_eq!(ended, vec![1, 2]);
    assert_eq!(read_bytes, 16384);

    drop(h.client);
    h.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_stops_a_read() {
    let mut h = serve(Duration::from_millis(200));
    let read = Call::Read(ReadRequest {
        export: "vda".to_string(),
        offset: 0,
        length: 0,
    });
    h.client
        .send(Frame::Control(Control::Request { id: 5, call: read }))
        .await
        .unwrap();
    h.client.send(Frame::Control(Control::Cancel { id: 5 })).await.unwrap();

    loop {
        match next(&mut h.client).await {
            Frame::Data { id: 5, .. } => continue,
            Frame::Control(Control::Error { id, kind, .. }) => {
                assert_eq!(id, 5);
                assert_eq!(kind, "cancelled");
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    drop(h.client);
    h.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn read_past_end_fails_only_that_call() {
    let mut h = serve(Duration::ZERO);
    let bad = Call::Read(ReadRequest {
        export: "vda".to_string(),
        offset: SIZE,
        length: 1,
    });
    h.client
        .send(Frame::Control(Control::Request { id: 1, call: bad }))
        .await
        .unwrap();
    match next(&mut h.client).await {
        Frame::Control(Control::Error { id: 1, kind, .. }) => assert_eq!(kind, "protocol"),
        other => panic!("unexpected frame {:?}", other),
    }

    h.client.send(Frame::Control(Control::Ping)).await.unwrap();
    assert_eq!(next(&mut h.client).await, Frame::Control(Control::Pong));

    drop(h.client);
    h.server.await.unwrap().unwrap();
}
