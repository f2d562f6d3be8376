//! One established TCP socket bound to one event loop.
//!
//! ```text
//!  Connecting ──established──> Connected ──close/error──> Disconnecting ──teardown──> Disconnected
//! ```
//!
//! Reads and writes only ever happen on the owning loop. `send`, `shutdown`
//! and `close` may be called from any thread; they hand their work to the
//! loop. The `Connected -> Disconnecting` step is a single compare-and-swap,
//! so concurrent closers agree on one winner and teardown runs once.

use std::{
    any::Any,
    fmt,
    io::{self, Read, Write},
    mem,
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use mio::{event::Event, net::TcpStream, Interest, Token};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    buffer::Buffer,
    event_loop::EventLoop,
    handler::EventHandler,
    net::tcp::traits::{ConnectionId, NetworkHandler, TcpConnectionRef},
    piece::{Piece, PiecePool},
    timer::TimerHandle,
};

/// Reads drained per readiness event before yielding to other work.
const MAX_READS_PER_EVENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Connecting => "Connecting",
            ConnState::Connected => "Connected",
            ConnState::Disconnecting => "Disconnecting",
            ConnState::Disconnected => "Disconnected",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub(crate) type CloseCallback = Box<dyn FnOnce(&TcpConnectionRef) + Send + 'static>;

struct ConnIo {
    stream: Option<TcpStream>,
    token: Option<Token>,
    input: Buffer,
    output: Buffer,
    pending: Option<Piece>,
    writing: bool,
    shutdown_pending: bool,
    delay_close: Option<TimerHandle>,
    torn_down: bool,
}

enum ReadOutcome {
    Drained,
    Yielded,
    Eof,
    Failed(io::Error),
}

enum WriteOutcome {
    Drained,
    Blocked,
    Failed(io::Error),
}

pub struct TcpConnection {
    id: ConnectionId,
    event_loop: EventLoop,
    pool: PiecePool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    close_requested: AtomicBool,
    io: Mutex<ConnIo>,
    handler: Arc<dyn NetworkHandler>,
    close_cb: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    pub(crate) fn new(
        id: ConnectionId,
        event_loop: EventLoop,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: Arc<dyn NetworkHandler>,
        pool: PiecePool,
    ) -> TcpConnectionRef {
        Arc::new_cyclic(|weak_self| TcpConnection {
            id,
            event_loop,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            close_requested: AtomicBool::new(false),
            io: Mutex::new(ConnIo {
                stream: Some(stream),
                token: None,
                input: Buffer::new(&pool),
                output: Buffer::new(&pool),
                pending: None,
                writing: false,
                shutdown_pending: false,
                delay_close: None,
                torn_down: false,
            }),
            pool,
            handler,
            close_cb: Mutex::new(None),
            context: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn pool(&self) -> &PiecePool {
        &self.pool
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_tcp_no_delay(&self, enabled: bool) -> io::Result<()> {
        match self.io.lock().stream.as_ref() {
            Some(stream) => stream.set_nodelay(enabled),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Attaches arbitrary user data to the connection, replacing any previous value.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.context.lock() = Some(Arc::new(value));
    }

    /// The attached user data, if any was set and it is a `T`.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let context = self.context.lock().clone()?;
        context.downcast::<T>().ok()
    }

    pub fn clear_context(&self) {
        self.context.lock().take();
    }

    /// Queues `data` for sending. Dropped with a warning unless connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if !self.is_connected() {
            warn!(conn = %self.id, state = self.state().as_str(), "send on inactive connection dropped");
            return;
        }
        let mut chain = Buffer::new(&self.pool);
        chain.write(data);
        self.send_chain(chain);
    }

    /// Moves the whole content of `buffer` to the outbound queue without
    /// copying it.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        if !self.is_connected() {
            warn!(conn = %self.id, state = self.state().as_str(), "send on inactive connection dropped");
            return;
        }
        let chain = buffer.detach();
        self.send_chain(chain);
    }

    /// Half-closes the socket: once queued data is flushed the write side is
    /// shut down. Reading continues until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Closes the connection. Safe to call any number of times from any thread;
    /// only the first call while connected has an effect.
    pub fn close(self: &Arc<Self>) {
        if self.begin_disconnect() {
            let conn = Arc::clone(self);
            self.event_loop.queue_in_loop(move || conn.handle_close());
        }
    }

    /// Like [`close`](Self::close), but the socket is torn down only after `delay`.
    pub fn close_with_delay(self: &Arc<Self>, delay: Duration) {
        if !self.begin_disconnect() {
            return;
        }
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            let mut io = conn.io.lock();
            if io.torn_down {
                return;
            }
            let target = Arc::clone(&conn);
            io.delay_close = Some(conn.event_loop.run_after(delay, move || target.handle_close()));
        });
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_cb.lock() = Some(callback);
    }

    /// Runs on the owning loop once the connection has been handed over to it.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.transition(ConnState::Connecting, ConnState::Connected).is_err() {
            return;
        }

        let registered = {
            let mut io = self.io.lock();
            let ConnIo { stream, token, .. } = &mut *io;
            match stream.as_mut() {
                Some(stream) => {
                    let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
                    self.event_loop
                        .register(stream, Interest::READABLE | Interest::WRITABLE, handler)
                        .map(|assigned| *token = Some(assigned))
                }
                None => Ok(()),
            }
        };
        if let Err(e) = registered {
            warn!(conn = %self.id, peer = %self.peer_addr, error = %e, "failed to register connection");
            self.handle_close();
            return;
        }

        debug!(conn = %self.id, peer = %self.peer_addr, "connection established");
        self.handler.on_connection(self);

        if self.close_requested.load(Ordering::Acquire) {
            self.close();
        }
        self.handle_read();
    }

    fn begin_disconnect(&self) -> bool {
        loop {
            match self.transition(ConnState::Connected, ConnState::Disconnecting) {
                Ok(()) => return true,
                Err(ConnState::Connecting) => {
                    // picked up by connect_established
                    self.close_requested.store(true, Ordering::Release);
                    if self.state() == ConnState::Connecting {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    fn transition(&self, from: ConnState, to: ConnState) -> Result<(), ConnState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnState::from_u8)
    }

    fn send_chain(self: &Arc<Self>, chain: Buffer) {
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || conn.send_in_loop(chain));
    }

    fn send_in_loop(self: &Arc<Self>, chain: Buffer) {
        if chain.is_empty() {
            return;
        }
        let outcome = {
            let mut io = self.io.lock();
            if io.torn_down {
                debug!(conn = %self.id, bytes = chain.len(), "send after teardown dropped");
                return;
            }
            io.output.append(chain);
            if io.writing {
                return;
            }
            Self::write_pending(&mut io)
        };
        self.after_write(outcome);
    }

    fn handle_read(self: &Arc<Self>) {
        let mut got_data = false;
        let outcome = {
            let mut io = self.io.lock();
            let ConnIo { stream, input, torn_down, .. } = &mut *io;
            if *torn_down {
                return;
            }
            let Some(stream) = stream.as_mut() else {
                return;
            };

            let mut reads = 0;
            loop {
                if reads == MAX_READS_PER_EVENT {
                    break ReadOutcome::Yielded;
                }
                let mut piece = self.pool.acquire();
                match stream.read(piece.spare_mut()) {
                    Ok(0) => break ReadOutcome::Eof,
                    Ok(n) => {
                        piece.commit(n);
                        input.append_piece(piece);
                        got_data = true;
                        reads += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::Drained,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break ReadOutcome::Failed(e),
                }
            }
        };

        if got_data {
            self.dispatch_input();
        }
        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::Yielded => {
                let conn = Arc::clone(self);
                self.event_loop.queue_in_loop(move || conn.handle_read());
            }
            ReadOutcome::Eof => {
                trace!(conn = %self.id, "peer closed its side");
                self.handle_close();
            }
            ReadOutcome::Failed(e) => self.handle_error(e),
        }
    }

    fn dispatch_input(self: &Arc<Self>) {
        // the handler gets the buffer unlocked so it may call back into the connection
        let mut input = mem::replace(&mut self.io.lock().input, Buffer::new(&self.pool));
        let result = self.handler.on_message(self, &mut input);
        {
            let mut io = self.io.lock();
            let arrived = mem::replace(&mut io.input, input);
            io.input.append(arrived);
        }
        if let Err(e) = result {
            warn!(conn = %self.id, error = %e, "message handler failed, closing");
            self.close();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        let outcome = {
            let mut io = self.io.lock();
            if io.torn_down || !io.writing {
                return;
            }
            Self::write_pending(&mut io)
        };
        self.after_write(outcome);
    }

    fn write_pending(io: &mut ConnIo) -> WriteOutcome {
        let ConnIo {
            stream,
            output,
            pending,
            writing,
            shutdown_pending,
            ..
        } = io;
        let Some(stream) = stream.as_mut() else {
            *writing = false;
            return WriteOutcome::Blocked;
        };

        loop {
            if pending.is_none() {
                *pending = output.pop_coalesced();
            }
            let Some(piece) = pending.as_mut() else {
                *writing = false;
                if mem::take(shutdown_pending) {
                    if let Err(e) = stream.shutdown(Shutdown::Write) {
                        return WriteOutcome::Failed(e);
                    }
                }
                return WriteOutcome::Drained;
            };

            *writing = true;
            match stream.write(piece.data()) {
                Ok(0) => return WriteOutcome::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    piece.consume(n);
                    if piece.is_empty() {
                        *pending = None;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return WriteOutcome::Failed(e),
            }
        }
    }

    fn after_write(self: &Arc<Self>, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Drained => self.handler.on_write_complete(self),
            WriteOutcome::Blocked => {}
            WriteOutcome::Failed(e) => self.handle_error(e),
        }
    }

    fn shutdown_in_loop(&self) {
        let mut io = self.io.lock();
        if io.torn_down {
            return;
        }
        if io.writing {
            io.shutdown_pending = true;
            return;
        }
        if let Some(stream) = io.stream.as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                debug!(conn = %self.id, error = %e, "write shutdown failed");
            }
        }
    }

    fn handle_error(self: &Arc<Self>, error: io::Error) {
        match error.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                debug!(conn = %self.id, peer = %self.peer_addr, error = %error, "connection dropped by peer");
            }
            _ => {
                warn!(conn = %self.id, peer = %self.peer_addr, error = %error, "connection error");
            }
        }
        self.handle_close();
    }

    /// Tears the socket down and reports it. Runs at most once.
    fn handle_close(self: &Arc<Self>) {
        {
            let mut io = self.io.lock();
            if io.torn_down {
                return;
            }
            io.torn_down = true;
            if let Some(timer) = io.delay_close.take() {
                timer.cancel();
            }
            let token = io.token.take();
            if let Some(mut stream) = io.stream.take() {
                if let Some(token) = token {
                    if let Err(e) = self.event_loop.deregister(&mut stream, token) {
                        debug!(conn = %self.id, error = %e, "deregister failed");
                    }
                }
                let _ = stream.shutdown(Shutdown::Both);
            }
            io.pending = None;
            io.writing = false;
            io.shutdown_pending = false;
            io.output.clear();
        }

        let _ = self.transition(ConnState::Connected, ConnState::Disconnecting);
        debug!(conn = %self.id, peer = %self.peer_addr, "connection closed");

        self.handler.on_connection(self);
        let close_cb = self.close_cb.lock().take();
        if let Some(close_cb) = close_cb {
            close_cb(self);
        }
        self.state
            .store(ConnState::Disconnected as u8, Ordering::Release);
    }

    fn take_socket_error(&self) -> io::Error {
        let io = self.io.lock();
        match io.stream.as_ref().map(TcpStream::take_error) {
            Some(Ok(Some(e))) | Some(Err(e)) => e,
            _ => io::Error::other("socket error"),
        }
    }
}

impl EventHandler for TcpConnection {
    fn handle_event(&self, event: &Event) {
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        if event.is_error() {
            let error = conn.take_socket_error();
            conn.handle_error(error);
            return;
        }
        if event.is_readable() || event.is_read_closed() {
            conn.handle_read();
        }
        if event.is_writable() {
            conn.handle_write();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let state = self.state();
        assert!(
            matches!(state, ConnState::Connecting | ConnState::Disconnected),
            "connection {} dropped while {}",
            self.id,
            state.as_str()
        );
        assert!(
            !self.io.get_mut().writing,
            "connection {} dropped with a write in flight",
            self.id
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
