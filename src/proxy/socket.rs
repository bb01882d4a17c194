use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The client-facing half of a connection pair.
///
/// The relay loop is written once against this capability set and
/// instantiated per stream kind; plain TCP and TLS-terminated sockets only
/// differ in the concrete stream wrapped by [`DirectSocket`].
pub trait ProxySocket: Send + Unpin + 'static {
    fn remote_addr(&self) -> SocketAddr;

    /// Read at least one byte into `buf`, returning 0 at EOF.
    fn read(&mut self, buf: &mut BytesMut) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write the whole of `buf` to the socket (full-write semantics).
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Shut down the write side, flushing any stream-level close handshake
    /// (close_notify for TLS) before the underlying socket closes.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

pub struct DirectSocket<S> {
    remote_addr: SocketAddr,
    stream: S,
}

impl<S> DirectSocket<S> {
    pub fn new(remote_addr: SocketAddr, stream: S) -> Self {
        Self {
            remote_addr,
            stream,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> ProxySocket for DirectSocket<S> {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.read_buf(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
