use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info};
use tracker_relay_protocol::text::Utf8Decoder;

use crate::dispatch::Server;

const MAX_DATAGRAM: usize = 65_535;

/// Runs the UDP half of the listener: one socket, one task, reading
/// datagrams in a loop. Only `Tracking` messages are meaningful here; the
/// fusion path is shared byte-for-byte with the TCP session handler.
pub async fn run(socket: UdpSocket, server: Arc<Server>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut decoder = Utf8Decoder::new();
    info!(local = ?socket.local_addr().ok(), "udp listener started");

    loop {
        let (n, remote): (usize, SocketAddr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, "udp recv_from failed");
                continue;
            }
        };
        server.handle_udp_message(&buf[..n], remote, &mut decoder).await;
    }
}
