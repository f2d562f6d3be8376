use std::{fmt, io, net::SocketAddr, sync::Arc};

use crate::{buffer::Buffer, error::Result, net::tcp::connection::TcpConnection};

pub type TcpConnectionRef = Arc<TcpConnection>;

/// Unique identifier for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callbacks a server or client drives for each of its connections.
///
/// Every method runs on the event loop that owns the connection.
pub trait NetworkHandler: Send + Sync + 'static {
    /// Called once the connection is established, and again on its way out
    /// (check [`TcpConnection::is_connected`]).
    fn on_connection(&self, conn: &TcpConnectionRef) {
        let _ = conn;
    }

    /// Called when new bytes were appended to `buffer`. Consume what you can;
    /// the rest stays buffered until more data arrives. Returning an error
    /// closes the connection.
    fn on_message(&self, conn: &TcpConnectionRef, buffer: &mut Buffer) -> Result<()>;

    /// Called whenever the outbound queue drained completely.
    fn on_write_complete(&self, conn: &TcpConnectionRef) {
        let _ = conn;
    }

    /// Called by a client when a connect attempt failed.
    fn on_connect_failed(&self, addr: SocketAddr, error: &io::Error) {
        let _ = (addr, error);
    }

    /// Called by a server for each accepted socket before any connection is
    /// created. Returning `false` drops the socket.
    fn accept_peer(&self, peer: &SocketAddr) -> bool {
        let _ = peer;
        true
    }
}

impl<H: NetworkHandler> NetworkHandler for Arc<H> {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        (**self).on_connection(conn)
    }

    fn on_message(&self, conn: &TcpConnectionRef, buffer: &mut Buffer) -> Result<()> {
        (**self).on_message(conn, buffer)
    }

    fn on_write_complete(&self, conn: &TcpConnectionRef) {
        (**self).on_write_complete(conn)
    }

    fn on_connect_failed(&self, addr: SocketAddr, error: &io::Error) {
        (**self).on_connect_failed(addr, error)
    }

    fn accept_peer(&self, peer: &SocketAddr) -> bool {
        (**self).accept_peer(peer)
    }
}
