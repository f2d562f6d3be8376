//! Echo client: sends a numbered `EchoRequest` every second and logs replies.
//!
//! ```text
//! cargo run --example echo_client -- [addr] [count]
//! ```

#[path = "echo_proto.rs"]
mod echo_proto;

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use echo_proto::{EchoRequest, EchoResponse};
use mill_tcp::prelude::*;
use tracing::{info, warn};

fn send_request(conn: &TcpConnectionRef, seq: u32) {
    send_message(
        conn,
        &EchoRequest {
            seq,
            text: format!("hello #{seq}"),
        },
    );
}

fn main() -> anyhow::Result<()> {
    echo_proto::init_tracing();

    let mut args = std::env::args().skip(1);
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| echo_proto::DEFAULT_ADDR.to_string())
        .parse()?;
    let count: u32 = match args.next() {
        Some(n) => n.parse()?,
        None => 5,
    };

    let event_loop = EventLoop::new("echo-client")?;
    let client_slot: Arc<OnceLock<TcpClient>> = Arc::new(OnceLock::new());

    let mut dispatcher = Dispatcher::new();
    Dispatcher::on_connection(&mut dispatcher, |conn| {
            if conn.is_connected() {
                info!(peer = %conn.peer_addr(), "connected");
                send_request(conn, 1);
            } else {
                warn!(peer = %conn.peer_addr(), "connection lost");
            }
        })
        .register::<EchoResponse, _>({
            let event_loop = event_loop.clone();
            let client_slot = client_slot.clone();
            move |conn, response| {
                info!(seq = response.seq, text = %response.text, "reply");
                if response.seq >= count {
                    if let Some(client) = client_slot.get() {
                        client.disconnect();
                    }
                    let stopper = event_loop.clone();
                    event_loop.run_after(Duration::from_millis(100), move || stopper.stop());
                    return;
                }
                let conn = conn.clone();
                let next = response.seq + 1;
                event_loop.run_after(Duration::from_secs(1), move || {
                    if conn.is_connected() {
                        send_request(&conn, next);
                    }
                });
            }
        });

    let config = TcpClientConfig::builder()
        .name("echo-client")
        .reconnect_interval(Duration::from_secs(1))
        .build();
    let client = TcpClient::new(
        &event_loop,
        server_addr,
        config,
        MessageCodec::new(echo_proto::registry(), dispatcher),
    );
    let _ = client_slot.set(client.clone());
    client.connect();

    event_loop.start()?;
    info!("done");
    Ok(())
}
