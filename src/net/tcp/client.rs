//! Outbound TCP connections with optional automatic reconnection.

use std::{
    any::Any,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use mio::{event::Event, net::TcpStream, Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    event_loop::EventLoop,
    handler::EventHandler,
    net::tcp::{
        config::TcpClientConfig,
        connection::TcpConnection,
        traits::{ConnectionId, NetworkHandler, TcpConnectionRef},
    },
    timer::TimerHandle,
};

static NEXT_CLIENT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connects to one server address and keeps at most one live connection.
///
/// With auto-reconnect on, a failed attempt is retried every
/// `reconnect_interval`, and a closed connection is re-dialled immediately,
/// until [`disconnect`](Self::disconnect) is called.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    event_loop: EventLoop,
    server_addr: SocketAddr,
    config: TcpClientConfig,
    handler: Arc<dyn NetworkHandler>,
    auto_reconnect: AtomicBool,
    /// Set by `connect`, cleared by `disconnect`.
    wanted: AtomicBool,
    state: Mutex<ClientState>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

#[derive(Default)]
struct ClientState {
    connector: Option<Connector>,
    connection: Option<TcpConnectionRef>,
    retry: Option<TimerHandle>,
}

/// A socket whose non-blocking connect has not completed yet.
struct Connector {
    stream: TcpStream,
    token: Token,
}

struct ConnectWatcher {
    client: Weak<ClientInner>,
}

impl EventHandler for ConnectWatcher {
    fn handle_event(&self, _event: &Event) {
        if let Some(client) = self.client.upgrade() {
            client.connect_ready();
        }
    }
}

impl TcpClient {
    /// Creates a client bound to `event_loop`. No socket is opened until
    /// [`connect`](Self::connect).
    pub fn new<H: NetworkHandler>(
        event_loop: &EventLoop,
        server_addr: SocketAddr,
        config: TcpClientConfig,
        handler: H,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                event_loop: event_loop.clone(),
                server_addr,
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                wanted: AtomicBool::new(false),
                config,
                handler: Arc::new(handler),
                state: Mutex::new(ClientState::default()),
                context: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// The live connection, if there is one. Safe from any thread.
    pub fn connection(&self) -> Option<TcpConnectionRef> {
        self.inner.state.lock().connection.clone()
    }

    pub fn is_auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::Acquire)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::Release);
    }

    /// Starts connecting. Ignored while an attempt is in flight or a
    /// connection is live.
    pub fn connect(&self) {
        self.inner.wanted.store(true, Ordering::Release);
        self.inner
            .auto_reconnect
            .store(self.inner.config.auto_reconnect, Ordering::Release);
        let client = Arc::clone(&self.inner);
        self.inner
            .event_loop
            .run_in_loop(move || client.connect_in_loop());
    }

    /// Turns auto-reconnect off and closes the connection, or abandons the
    /// pending attempt. Safe from any thread.
    ///
    /// A connect that completes between this call and the loop picking it up
    /// is dropped without ever becoming a connection.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.wanted.store(false, Ordering::Release);
        inner.auto_reconnect.store(false, Ordering::Release);
        let client = Arc::clone(inner);
        inner
            .event_loop
            .run_in_loop(move || client.disconnect_in_loop());
    }

    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.inner.context.lock() = Some(Arc::new(value));
    }

    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let context = self.inner.context.lock().clone()?;
        context.downcast::<T>().ok()
    }
}

impl ClientInner {
    fn connect_in_loop(self: &Arc<Self>) {
        if !self.wanted.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if state.connector.is_some() || state.connection.is_some() {
            debug!(client = %self.config.name, "connect ignored, already connecting or connected");
            return;
        }
        if let Some(retry) = state.retry.take() {
            retry.cancel();
        }

        debug!(client = %self.config.name, addr = %self.server_addr, "connecting");
        let mut stream = match open_stream(self.server_addr, self.config.local_address) {
            Ok(stream) => stream,
            Err(e) => {
                drop(state);
                self.connect_failed(e);
                return;
            }
        };
        let watcher = Arc::new(ConnectWatcher {
            client: Arc::downgrade(self),
        });
        match self
            .event_loop
            .register(&mut stream, Interest::WRITABLE, watcher)
        {
            Ok(token) => state.connector = Some(Connector { stream, token }),
            Err(e) => {
                drop(state);
                self.connect_failed(into_io_error(e));
            }
        }
    }

    fn connect_ready(self: &Arc<Self>) {
        let (connector, outcome) = {
            let mut state = self.state.lock();
            let Some(connector) = state.connector.as_ref() else {
                return;
            };
            let outcome = match connector.stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match connector.stream.peer_addr() {
                    Ok(peer) => Ok(peer),
                    // still in progress, wait for the next readiness
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                    Err(e) => Err(e),
                },
            };
            (state.connector.take(), outcome)
        };
        let Some(Connector { mut stream, token }) = connector else {
            return;
        };
        if let Err(e) = self.event_loop.deregister(&mut stream, token) {
            debug!(client = %self.config.name, error = %e, "connector deregister failed");
        }

        match outcome {
            Ok(peer) => self.new_connection(stream, peer),
            Err(e) => self.connect_failed(e),
        }
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.wanted.load(Ordering::Acquire) {
            debug!(client = %self.config.name, peer = %peer, "connect completed after disconnect, dropped");
            return;
        }
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            warn!(client = %self.config.name, error = %e, "failed to set TCP_NODELAY");
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.connect_failed(e);
                return;
            }
        };

        let id = ConnectionId(NEXT_CLIENT_CONN_ID.fetch_add(1, Ordering::Relaxed));
        let conn = TcpConnection::new(
            id,
            self.event_loop.clone(),
            stream,
            local_addr,
            peer,
            Arc::clone(&self.handler),
            self.config.pool.clone(),
        );
        let client = Arc::downgrade(self);
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(client) = client.upgrade() {
                client.remove_connection(conn);
            }
        }));
        self.state.lock().connection = Some(Arc::clone(&conn));

        info!(client = %self.config.name, conn = %id, peer = %peer, "connected");
        self.event_loop
            .queue_in_loop(move || conn.connect_established());
    }

    fn connect_failed(self: &Arc<Self>, error: io::Error) {
        warn!(client = %self.config.name, addr = %self.server_addr, error = %error, "connect failed");
        self.handler.on_connect_failed(self.server_addr, &error);
        if !self.auto_reconnect.load(Ordering::Acquire) {
            return;
        }

        let interval = self.config.reconnect_interval;
        let client = Arc::downgrade(self);
        let retry = self.event_loop.run_after(interval, move || {
            if let Some(client) = client.upgrade() {
                if client.auto_reconnect.load(Ordering::Acquire) {
                    client.connect_in_loop();
                }
            }
        });
        self.state.lock().retry = Some(retry);
        info!(
            client = %self.config.name,
            addr = %self.server_addr,
            retry_in_ms = interval.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    /// Close callback of the live connection; runs on the loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        {
            let mut state = self.state.lock();
            if state
                .connection
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, conn))
            {
                state.connection = None;
            }
        }
        if self.auto_reconnect.load(Ordering::Acquire) {
            info!(client = %self.config.name, conn = %conn.id(), addr = %self.server_addr, "connection lost, reconnecting");
            self.connect_in_loop();
        }
    }

    fn disconnect_in_loop(&self) {
        let (connector, connection, retry) = {
            let mut state = self.state.lock();
            (
                state.connector.take(),
                state.connection.clone(),
                state.retry.take(),
            )
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(Connector { mut stream, token }) = connector {
            debug!(client = %self.config.name, "pending connect abandoned");
            if let Err(e) = self.event_loop.deregister(&mut stream, token) {
                debug!(client = %self.config.name, error = %e, "connector deregister failed");
            }
        }
        if let Some(connection) = connection {
            connection.close();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(retry) = state.retry.take() {
            retry.cancel();
        }
        if let Some(Connector { mut stream, token }) = state.connector.take() {
            let _ = self.event_loop.deregister(&mut stream, token);
        }
        if let Some(connection) = state.connection.take() {
            connection.close();
        }
    }
}

fn open_stream(server: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(local) = local else {
        return TcpStream::connect(server);
    };
    let socket = Socket::new(Domain::for_address(server), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    match socket.connect(&server.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn into_io_error(error: Error) -> io::Error {
    match error {
        Error::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("name", &self.inner.config.name)
            .field("server_addr", &self.inner.server_addr)
            .field("connected", &self.connection().is_some())
            .finish()
    }
}
