//! TCP server, client and the connection type they share.
//!
//! Every connection is owned by exactly one event loop. A server accepts on
//! its base loop and hands each new socket to the next worker loop; a client
//! keeps its single connection on the loop it was created with.
//!
//! ```text
//!   TcpServer ──accept──┐                  ┌── TcpClient ──connect
//!                       ▼                  ▼
//!                 TcpConnection (one per socket, one owning loop)
//!                       │
//!        on_connection / on_message / on_write_complete
//!                       ▼
//!                 NetworkHandler (yours, or a MessageCodec)
//! ```
//!
//! ## Handler implementation
//!
//! ```rust
//! use mill_tcp::buffer::Buffer;
//! use mill_tcp::error::Result;
//! use mill_tcp::net::tcp::{NetworkHandler, TcpConnectionRef};
//!
//! struct Echo;
//!
//! impl NetworkHandler for Echo {
//!     fn on_message(&self, conn: &TcpConnectionRef, buffer: &mut Buffer) -> Result<()> {
//!         conn.send_buffer(buffer);
//!         Ok(())
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod server;
pub mod traits;

pub use client::TcpClient;
pub use config::{TcpClientConfig, TcpClientConfigBuilder, TcpServerConfig, TcpServerConfigBuilder};
pub use connection::{ConnState, TcpConnection};
pub use server::TcpServer;
pub use traits::{ConnectionId, NetworkHandler, TcpConnectionRef};
