use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tracker_relay_protocol::header::{self, HEADER_LEN};
use tracker_relay_protocol::text::Utf8Decoder;
use tracker_relay_protocol::ParseError;

use crate::device::next_session_id;
use crate::dispatch::Server;
use crate::metrics;

const READ_CHUNK: usize = 4096;

/// Runs one TCP connection end to end: a read loop that defragments the
/// byte stream into complete frames, a paired writer task draining this
/// session's subscriber mailbox, and a read-idle timer. The socket is fully
/// owned here. Nothing about a session leaks into `DeviceState` beyond the
/// `SubscriberHandle` it may register via `dispatch`.
pub async fn run(stream: TcpStream, remote: SocketAddr, server: Arc<Server>) {
    let session_id = next_session_id();
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    metrics::connection_opened();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let bytes_received = AtomicU64::new(0);
    let idle_timeout = server.session_idle_timeout();
    let mut ticker = tokio::time::interval(idle_timeout);
    ticker.tick().await; // the first tick fires immediately; consume it before waiting a full interval
    let mut last_seen = 0u64;

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::new();

    'outer: loop {
        tokio::select! {
            read_result = read_half.read(&mut scratch) => {
                match read_result {
                    Ok(0) | Err(_) => break 'outer,
                    Ok(n) => {
                        bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        buf.extend_from_slice(&scratch[..n]);

                        loop {
                            match try_extract_frame(&buf) {
                                Ok(Some(frame_len)) => {
                                    let frame: Vec<u8> = buf.drain(..frame_len).collect();
                                    let close = server
                                        .handle_tcp_message(&frame, remote, session_id, &tx, &mut decoder)
                                        .await;
                                    if close {
                                        break 'outer;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(
                                        %remote,
                                        %err,
                                        frame_prefix = %hex::encode(&buf[..buf.len().min(HEADER_LEN * 4)]),
                                        "closing connection on framing error"
                                    );
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                let current = bytes_received.load(Ordering::Relaxed);
                if current == last_seen {
                    debug!(session_id, %remote, "closing idle session");
                    break 'outer;
                }
                last_seen = current;
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    server.registry().remove_subscription(session_id);
    metrics::connection_closed();
}

/// Returns `Ok(Some(len))` if `buf` already holds one complete frame,
/// `Ok(None)` if more bytes are needed, or `Err` if the declared header is
/// invalid (closes the connection: a framing error, not a field error).
fn try_extract_frame(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = header::read_header(buf)?;
    let frame_len = header.size as usize;
    if frame_len < HEADER_LEN {
        return Err(ParseError::BodyTooShort {
            what: "frame",
            need: HEADER_LEN,
            got: frame_len,
        });
    }
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(frame_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_more_header_bytes() {
        let buf = vec![0u8; 2];
        assert_eq!(try_extract_frame(&buf).unwrap(), None);
    }

    #[test]
    fn waits_for_the_full_body_before_extracting() {
        let mut full = vec![0u8; 10];
        header::write_header(&mut full, 10, 1);
        assert_eq!(try_extract_frame(&full[..6]).unwrap(), None);
        assert_eq!(try_extract_frame(&full).unwrap(), Some(10));
    }

    #[test]
    fn rejects_a_size_smaller_than_the_header_itself() {
        let mut buf = [0u8; 4];
        header::write_header(&mut buf, 1, 1);
        assert!(try_extract_frame(&buf).is_err());
    }
}
