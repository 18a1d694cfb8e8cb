//! A listener that yields one established connection.

use crate::export::Listener;
use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Hands out its connection on the first accept. Later accepts wait until
/// that connection is dropped, then fail with `ListenerClosed`.
pub struct SingleConnListener<C> {
    conn: Option<C>,
    done: CancellationToken,
}

impl<C> SingleConnListener<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Some(conn),
            done: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<C> Listener for SingleConnListener<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = TrackedConn<C>;

    async fn accept(&mut self) -> Result<TrackedConn<C>> {
        if let Some(inner) = self.conn.take() {
            return Ok(TrackedConn {
                inner,
                _release: self.done.clone().drop_guard(),
            });
        }
        self.done.cancelled().await;
        Err(SupervisorError::ListenerClosed)
    }
}

/// Connection that releases its listener when dropped
pub struct TrackedConn<C> {
    inner: C,
    _release: DropGuard,
}

impl<C: AsyncRead + Unpin> AsyncRead for TrackedConn<C> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TrackedConn<C> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_accept_waits_for_release() {
        let (conn, _peer) = tokio::io::duplex(64);
        let mut listener = SingleConnListener::new(conn);
        let first = listener.accept().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(blocked.is_err());

        drop(first);
        let closed = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap();
        assert!(matches!(closed, Err(SupervisorError::ListenerClosed)));
    }
}
