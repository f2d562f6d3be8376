//! Multi-loop TCP server.
//!
//! ```text
//!   base loop                         worker loops (round-robin)
//!  ┌─────────────────────┐           ┌──────────────────────┐
//!  │ Acceptor            │──accept──▶│ TcpConnection  #1    │
//!  │ connection map      │           │ TcpConnection  #4    │
//!  │ stop() state machine│◀─removed──│ ...                  │
//!  └─────────────────────┘           └──────────────────────┘
//! ```
//!
//! The connection map is only touched on the base loop. Shutdown drains in
//! order: listener first, then every live connection, then the worker pool.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Interest, Token,
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    event_loop::EventLoop,
    handler::EventHandler,
    net::tcp::{
        config::TcpServerConfig,
        connection::TcpConnection,
        traits::{ConnectionId, NetworkHandler, TcpConnectionRef},
    },
    status::{Status, StatusCell, SubStatus},
    thread_pool::EventLoopThreadPool,
};

type StoppedCallback = Box<dyn FnOnce() + Send + 'static>;

/// A listening socket plus the worker loops its connections live on.
///
/// Cloning gives another handle to the same server.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base_loop: EventLoop,
    config: TcpServerConfig,
    handler: Arc<dyn NetworkHandler>,
    pool: EventLoopThreadPool,
    status: StatusCell,
    local_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    acceptor: Option<(TcpListener, Token)>,
    connections: HashMap<ConnectionId, TcpConnectionRef>,
    next_conn_id: u64,
    on_stopped: Option<StoppedCallback>,
}

struct Acceptor {
    server: Weak<ServerInner>,
}

impl EventHandler for Acceptor {
    fn handle_event(&self, event: &Event) {
        if !event.is_readable() {
            return;
        }
        if let Some(server) = self.server.upgrade() {
            server.accept_ready();
        }
    }
}

impl TcpServer {
    /// Creates a server whose acceptor lives on `base_loop`. Nothing is bound
    /// until [`start`](Self::start).
    pub fn new<H: NetworkHandler>(
        base_loop: &EventLoop,
        config: TcpServerConfig,
        handler: H,
    ) -> Result<Self> {
        let pool = EventLoopThreadPool::new(base_loop, config.worker_threads, &config.name)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                base_loop: base_loop.clone(),
                config,
                handler: Arc::new(handler),
                pool,
                status: StatusCell::new(),
                local_addr: Mutex::new(None),
                state: Mutex::new(ServerState::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    pub fn sub_status(&self) -> SubStatus {
        self.inner.status.sub()
    }

    /// The bound address, available once `start` returned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn base_loop(&self) -> &EventLoop {
        &self.inner.base_loop
    }

    /// Binds the listener, starts the worker loops and begins accepting on
    /// the base loop. Bind errors are returned here.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .status
            .transition(Status::Null, Status::Starting)
            .map_err(|actual| Error::invalid_state("tcp server", "Null", actual.as_str()))?;

        let listener = match bind_listener(&inner.config) {
            Ok(listener) => listener,
            Err(e) => {
                inner.status.set(Status::Null);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local_addr);

        if let Err(e) = inner.pool.start(true) {
            inner.status.set(Status::Null);
            return Err(e);
        }

        let server = Arc::clone(inner);
        inner
            .base_loop
            .run_in_loop(move || server.listen_in_loop(listener));

        inner.status.set(Status::Running);
        info!(
            server = %inner.config.name,
            addr = %local_addr,
            workers = inner.pool.thread_count(),
            "server started"
        );
        Ok(())
    }

    /// Gracefully stops the server without blocking.
    ///
    /// The listener closes first, then every live connection is closed. Once
    /// the last one is gone the worker loops stop and `on_stopped` runs, once,
    /// on the base loop. [`sub_status`](Self::sub_status) stays
    /// [`SubStatus::None`] until the listener is closed.
    pub fn stop<F>(&self, on_stopped: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        inner
            .status
            .transition(Status::Running, Status::Stopping)
            .map_err(|actual| Error::invalid_state("tcp server", "Running", actual.as_str()))?;
        inner.state.lock().on_stopped = Some(Box::new(on_stopped));

        let server = Arc::clone(inner);
        inner.base_loop.run_in_loop(move || server.stop_in_loop());
        Ok(())
    }
}

impl ServerInner {
    fn listen_in_loop(self: &Arc<Self>, mut listener: TcpListener) {
        if self.status.get() == Status::Stopping {
            return;
        }
        let acceptor = Arc::new(Acceptor {
            server: Arc::downgrade(self),
        });
        match self
            .base_loop
            .register(&mut listener, Interest::READABLE, acceptor)
        {
            Ok(token) => {
                self.state.lock().acceptor = Some((listener, token));
                // connections that queued up before registration
                self.accept_ready();
            }
            Err(e) => {
                error!(server = %self.config.name, error = %e, "failed to register listener");
            }
        }
    }

    fn accept_ready(self: &Arc<Self>) {
        loop {
            let accepted = {
                let state = self.state.lock();
                let Some((listener, _)) = state.acceptor.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => self.new_connection(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::Interrupted
                            | std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(server = %self.config.name, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.handler.accept_peer(&peer) {
            debug!(server = %self.config.name, peer = %peer, "peer rejected");
            return;
        }
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            warn!(server = %self.config.name, peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(server = %self.config.name, peer = %peer, error = %e, "accepted socket has no local address");
                return;
            }
        };

        let io_loop = self.pool.next_loop();
        let mut state = self.state.lock();
        state.next_conn_id += 1;
        let id = ConnectionId(state.next_conn_id);
        let conn = TcpConnection::new(
            id,
            io_loop.clone(),
            stream,
            local_addr,
            peer,
            Arc::clone(&self.handler),
            self.config.pool.clone(),
        );
        let server = Arc::downgrade(self);
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(server) = server.upgrade() {
                server.remove_connection(conn);
            }
        }));
        state.connections.insert(id, Arc::clone(&conn));
        drop(state);

        debug!(server = %self.config.name, conn = %id, peer = %peer, event_loop = %io_loop.name(), "accepted connection");
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Close callback of every connection; runs on the connection's loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let server = Arc::clone(self);
        let id = conn.id();
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_loop(id));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, id: ConnectionId) {
        let (removed, drained) = {
            let mut state = self.state.lock();
            let removed = state.connections.remove(&id);
            (removed, state.connections.is_empty())
        };
        if let Some(conn) = removed {
            // the last reference goes away on the connection's own loop,
            // after its teardown finished
            let io_loop = conn.event_loop().clone();
            io_loop.queue_in_loop(move || drop(conn));
        }
        if drained && self.status.get() == Status::Stopping {
            self.stop_thread_pool();
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        let (acceptor, connections) = {
            let mut state = self.state.lock();
            let connections: Vec<TcpConnectionRef> = state.connections.values().cloned().collect();
            (state.acceptor.take(), connections)
        };
        if let Some((mut listener, token)) = acceptor {
            if let Err(e) = self.base_loop.deregister(&mut listener, token) {
                debug!(server = %self.config.name, error = %e, "listener deregister failed");
            }
        }
        // removals that ran before this point must not advance the shutdown
        self.status.set_sub(SubStatus::StoppingListener);
        info!(server = %self.config.name, connections = connections.len(), "stopping server");

        if connections.is_empty() {
            self.stop_thread_pool();
            return;
        }
        for conn in connections {
            conn.close();
        }
    }

    fn stop_thread_pool(self: &Arc<Self>) {
        if self.status.sub() != SubStatus::StoppingListener {
            return;
        }
        self.status.set_sub(SubStatus::StoppingThreadPool);
        let server = Arc::clone(self);
        if let Err(e) = self.pool.stop(move || server.finish_stop()) {
            warn!(server = %self.config.name, error = %e, "thread pool was not running");
            self.finish_stop();
        }
    }

    fn finish_stop(&self) {
        self.status.set(Status::Stopped);
        self.status.set_sub(SubStatus::None);
        info!(server = %self.config.name, "server stopped");
        let on_stopped = self.state.lock().on_stopped.take();
        if let Some(on_stopped) = on_stopped {
            on_stopped();
        }
    }
}

fn bind_listener(config: &TcpServerConfig) -> Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(config.address),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&config.address.into())?;
    socket.listen(config.backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.inner.config.name)
            .field("status", &self.status())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::net::tcp::connection::tests::wait_until;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    struct Sink;

    impl NetworkHandler for Sink {
        fn on_message(&self, _conn: &TcpConnectionRef, buffer: &mut Buffer) -> Result<()> {
            buffer.clear();
            Ok(())
        }
    }

    fn spawn_base() -> (EventLoop, thread::JoinHandle<Result<()>>) {
        let base = EventLoop::new("server-base").unwrap();
        let runner = base.clone();
        let handle = thread::spawn(move || runner.start());
        assert!(wait_until(Duration::from_secs(5), || base.status() == Status::Running));
        (base, handle)
    }

    #[test]
    fn test_stop_without_connections() {
        let (base, runner) = spawn_base();
        let config = TcpServerConfig::builder().worker_threads(2).build();
        let server = TcpServer::new(&base, config, Sink).unwrap();
        server.start().unwrap();
        assert_eq!(server.status(), Status::Running);
        assert!(server.local_addr().unwrap().port() > 0);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        server
            .stop(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1));
        assert_eq!(server.status(), Status::Stopped);
        assert_eq!(server.sub_status(), SubStatus::None);

        base.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_requires_running() {
        let base = EventLoop::new("idle-base").unwrap();
        let server = TcpServer::new(&base, TcpServerConfig::default(), Sink).unwrap();
        let err = server.stop(|| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = EventLoop::new("conflict-base").unwrap();
        let config = TcpServerConfig::builder()
            .address(taken.local_addr().unwrap())
            .worker_threads(0)
            .build();
        let server = TcpServer::new(&base, config, Sink).unwrap();

        assert!(matches!(server.start(), Err(Error::Io(_))));
        assert_eq!(server.status(), Status::Null);
    }

    #[test]
    fn test_rejected_peer_gets_no_connection() {
        struct Picky(AtomicUsize);

        impl NetworkHandler for Picky {
            fn on_message(&self, _conn: &TcpConnectionRef, buffer: &mut Buffer) -> Result<()> {
                buffer.clear();
                Ok(())
            }

            fn accept_peer(&self, _peer: &SocketAddr) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                false
            }
        }

        let (base, runner) = spawn_base();
        let handler = Arc::new(Picky(AtomicUsize::new(0)));
        let config = TcpServerConfig::builder().worker_threads(1).build();
        let server = TcpServer::new(&base, config, handler.clone()).unwrap();
        server.start().unwrap();

        let _client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || handler.0.load(Ordering::SeqCst) == 1));
        assert_eq!(server.connection_count(), 0);

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        server
            .stop(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));
        base.stop();
        runner.join().unwrap().unwrap();
    }
}
