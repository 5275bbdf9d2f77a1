//! Tracked upstream connections.
//!
//! # Responsibilities
//! - Give each dialed connection a process-unique ID
//! - Keep a second handle to the socket so the owning server can force it closed
//! - Deregister from the owning server exactly once, on close or drop

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::load_balancer::server::TrackedServer;

/// Relaxed ordering is enough; IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Duplicate of a connection's socket, held in the server's tracking set.
///
/// Shutting it down ends the connection for whoever owns the primary handle.
#[derive(Debug)]
pub(crate) struct CloseHandle {
    socket: std::net::TcpStream,
}

impl CloseHandle {
    /// Shut down both directions. A connection that already finished both
    /// directions counts as closed.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }
}

/// Split a freshly dialed stream into the owner's stream and a close handle.
pub(crate) fn split_close_handle(stream: TcpStream) -> io::Result<(TcpStream, CloseHandle)> {
    let std_stream = stream.into_std()?;
    let socket = std_stream.try_clone()?;
    let stream = TcpStream::from_std(std_stream)?;
    Ok((stream, CloseHandle { socket }))
}

/// A byte-stream connection registered with the server it was dialed to.
#[derive(Debug)]
pub struct TrackedConnection {
    id: ConnectionId,
    stream: TcpStream,
    handle: Arc<CloseHandle>,
    server: Weak<TrackedServer>,
    server_address: String,
}

impl TrackedConnection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        handle: Arc<CloseHandle>,
        server: &Arc<TrackedServer>,
    ) -> Self {
        Self {
            id,
            stream,
            handle,
            server: Arc::downgrade(server),
            server_address: server.address().to_string(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the server this connection was dialed to.
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Deregister from the owning server, then close the socket.
    ///
    /// Deregistration is idempotent. The returned error is whatever the
    /// socket shutdown reports; closing a finished connection succeeds.
    pub fn close(&self) -> io::Result<()> {
        if let Some(server) = self.server.upgrade() {
            server.remove(self.id);
        }
        self.handle.shutdown()
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.remove(self.id);
        }
        tracing::trace!(connection_id = %self.id, server = %self.server_address, "Connection released");
    }
}

impl AsyncRead for TrackedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[tokio::test]
    async fn close_after_peer_closed_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
        });

        let server = TrackedServer::new(addr.clone());
        let mut conn = server
            .register(TcpStream::connect(&addr).await.unwrap())
            .unwrap();

        conn.shutdown().await.unwrap();
        peer.await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

        conn.close().unwrap();
        assert!(server.is_empty());
        conn.close().unwrap();
    }
}
