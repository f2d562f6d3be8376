use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{piece::PiecePool, utils::default_worker_threads};

pub const DEFAULT_BACKLOG: i32 = 1024;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Configuration for TCP server.
///
/// Use `TcpServerConfig::builder()` for ergonomic construction.
///
/// - worker_threads: number of I/O loops connections are spread over; 0 keeps
///   every connection on the base loop
/// - pool: piece pool shared by every connection buffer of this server
#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Name used for worker threads and logs
    pub name: String,
    /// Number of worker loops
    pub worker_threads: usize,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// Listen backlog
    pub backlog: i32,
    /// Piece pool for connection buffers
    pub pool: PiecePool,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            name: "tcp-server".to_string(),
            worker_threads: default_worker_threads(),
            no_delay: true,
            backlog: DEFAULT_BACKLOG,
            pool: PiecePool::new(),
        }
    }
}

/// Builder for TcpServerConfig.
///
/// Unset fields fall back to `TcpServerConfig::default()`.
#[derive(Default)]
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    name: Option<String>,
    worker_threads: Option<usize>,
    no_delay: Option<bool>,
    backlog: Option<i32>,
    pool: Option<PiecePool>,
}

impl TcpServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn pool(mut self, pool: PiecePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            name: self.name.unwrap_or(default.name),
            worker_threads: self.worker_threads.unwrap_or(default.worker_threads),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            backlog: self.backlog.unwrap_or(default.backlog),
            pool: self.pool.unwrap_or(default.pool),
        }
    }
}

/// Configuration for TCP client.
#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    /// Name used in logs
    pub name: String,
    /// Local address to bind before connecting
    pub local_address: Option<SocketAddr>,
    /// Retry after connect failures and reconnect after the connection closes
    pub auto_reconnect: bool,
    /// Delay before retrying a failed connect
    pub reconnect_interval: Duration,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// Piece pool for connection buffers
    pub pool: PiecePool,
}

impl TcpClientConfig {
    pub fn builder() -> TcpClientConfigBuilder {
        TcpClientConfigBuilder::new()
    }
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            name: "tcp-client".to_string(),
            local_address: None,
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            no_delay: true,
            pool: PiecePool::new(),
        }
    }
}

#[derive(Default)]
pub struct TcpClientConfigBuilder {
    name: Option<String>,
    local_address: Option<SocketAddr>,
    auto_reconnect: Option<bool>,
    reconnect_interval: Option<Duration>,
    no_delay: Option<bool>,
    pool: Option<PiecePool>,
}

impl TcpClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn pool(mut self, pool: PiecePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> TcpClientConfig {
        let default = TcpClientConfig::default();
        TcpClientConfig {
            name: self.name.unwrap_or(default.name),
            local_address: self.local_address.or(default.local_address),
            auto_reconnect: self.auto_reconnect.unwrap_or(default.auto_reconnect),
            reconnect_interval: self.reconnect_interval.unwrap_or(default.reconnect_interval),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            pool: self.pool.unwrap_or(default.pool),
        }
    }
}
