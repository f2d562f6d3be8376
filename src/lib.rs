//! # mill-tcp
//! Reactor-based TCP networking on top of [`mio`], without an async runtime.
//!
//! Every [`EventLoop`] owns one poller and runs on one thread. Sockets,
//! timers and queued tasks of a loop are only ever touched on that thread;
//! other threads talk to it by queueing closures.
//! ## Features
//! - **Loop per thread**: a base loop plus N worker loops, connections spread round-robin
//! - **Segmented buffers**: fixed 4 KiB pieces recycled through a shared [`PiecePool`]
//! - **Zero-copy views**: serializers read and write pieces in place
//! - **Graceful shutdown**: listener, then connections, then worker threads
//! - **Reconnecting clients**: fixed-interval retry until told to stop
//! - **Typed messages**: length-prefixed frames routed by type name
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ TcpServer   │───▶│ EventLoop    │───▶│ PollHandle   │
//! │ TcpClient   │    │ (base)       │    │ token→handler│
//! └─────────────┘    └──────────────┘    └──────────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ EventLoopThread- │───▶│ TcpConnection│───▶│ MessageCodec │
//! │ Pool (workers)   │    │ Buffer in/out│    │ Dispatcher   │
//! └──────────────────┘    └──────────────┘    └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_tcp::prelude::*;
//!
//! struct Echo;
//!
//! impl NetworkHandler for Echo {
//!     fn on_message(&self, conn: &TcpConnectionRef, buffer: &mut Buffer) -> mill_tcp::Result<()> {
//!         conn.send_buffer(buffer);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> mill_tcp::Result<()> {
//!     let base = EventLoop::new("main")?;
//!     let config = TcpServerConfig::builder()
//!         .address("127.0.0.1:8080".parse().unwrap())
//!         .worker_threads(4)
//!         .build();
//!
//!     let server = TcpServer::new(&base, config, Echo)?;
//!     server.start()?;
//!
//!     // blocks until `base.stop()`
//!     base.start()
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod net;
pub mod piece;
pub mod poll;
pub mod reactor;
pub mod status;
pub mod thread_pool;
pub mod timer;
pub mod utils;

pub use buffer::{Buffer, InputView, OutputView};
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use handler::EventHandler;
pub use mio::event::Event;
pub use piece::{Piece, PiecePool, PoolStats};
pub use status::{Status, SubStatus};
pub use timer::TimerHandle;

/// Prelude module for convenient imports.
///
/// ```rust
/// use mill_tcp::prelude::*;
/// ```
///
/// This brings into scope the loop and its thread pool, buffers, the TCP
/// types with their handler trait and configuration, and the message codec.
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::codec::{
        send_message, Dispatcher, Message, MessageCodec, MessageHandler, MessagePtr,
        MessageRegistry, NamedMessage,
    };
    pub use crate::event_loop::EventLoop;
    pub use crate::handler::EventHandler;
    pub use crate::net::tcp::{
        ConnectionId, NetworkHandler, TcpClient, TcpClientConfig, TcpConnectionRef, TcpServer,
        TcpServerConfig,
    };
    pub use crate::piece::PiecePool;
    pub use crate::thread_pool::{EventLoopThread, EventLoopThreadPool};
}
