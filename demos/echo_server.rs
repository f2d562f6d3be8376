//! Echo server: answers every `EchoRequest` with an `EchoResponse`.
//!
//! ```text
//! cargo run --example echo_server -- [addr] [workers]
//! ```

#[path = "echo_proto.rs"]
mod echo_proto;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use echo_proto::{EchoRequest, EchoResponse};
use mill_tcp::prelude::*;
use tracing::info;

fn main() -> anyhow::Result<()> {
    echo_proto::init_tracing();

    let mut args = std::env::args().skip(1);
    let address: SocketAddr = args
        .next()
        .unwrap_or_else(|| echo_proto::DEFAULT_ADDR.to_string())
        .parse()?;
    let workers: usize = match args.next() {
        Some(n) => n.parse()?,
        None => mill_tcp::utils::default_worker_threads(),
    };

    let served = Arc::new(AtomicU64::new(0));
    let mut dispatcher = Dispatcher::new();
    Dispatcher::on_connection(&mut dispatcher, |conn| {
            let state = if conn.is_connected() { "up" } else { "down" };
            info!(conn = %conn.id(), peer = %conn.peer_addr(), state, "client");
        })
        .register::<EchoRequest, _>({
            let served = served.clone();
            move |conn, request| {
                served.fetch_add(1, Ordering::Relaxed);
                send_message(
                    conn,
                    &EchoResponse {
                        seq: request.seq,
                        text: request.text.clone(),
                    },
                );
            }
        });

    let pool = PiecePool::new();
    let config = TcpServerConfig::builder()
        .address(address)
        .name("echo")
        .worker_threads(workers)
        .pool(pool.clone())
        .build();

    let base = EventLoop::new("echo-base")?;
    let server = TcpServer::new(
        &base,
        config,
        MessageCodec::new(echo_proto::registry(), dispatcher),
    )?;
    server.start()?;
    info!(addr = ?server.local_addr(), workers, "echo server listening");

    let stats_server = server.clone();
    base.run_every(Duration::from_secs(5), move || {
        let pieces = pool.stats();
        info!(
            connections = stats_server.connection_count(),
            served = served.load(Ordering::Relaxed),
            pieces_in_use = pieces.in_use,
            pieces_idle = pieces.idle,
            "stats"
        );
    });

    base.start()?;
    Ok(())
}
