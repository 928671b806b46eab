use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use tracker_relay_protocol::message_id::MessageId;
use tracker_relay_protocol::messages::{
    monitor_link_reply, monitor_link_request, register_reply, resync_reply, resync_request,
    stream_open_request, tracker_link_reply, tracker_link_request, tracking_to_monitor,
    tracking_to_server,
};
use tracker_relay_protocol::text::Utf8Decoder;
use tracker_relay_protocol::{header, tlv, DeviceId};

use crate::device::SubscriberHandle;
use crate::link_broker::LinkBroker;
use crate::metrics;
use crate::persistence::PersistenceHandle;
use crate::rate_limiter::{RateLimiter, RemoteAddr};
use crate::registry::{self, Registry};

/// Owns every piece of shared state a session or the UDP loop needs to
/// decode and act on one framed message. Cheaply `Arc`-shared: one instance
/// per process, cloned into every session task.
pub struct Server {
    registry: Registry,
    rate_limiter: Arc<RateLimiter>,
    link_broker: Arc<LinkBroker>,
    persistence: PersistenceHandle,
    session_idle: Duration,
    storage_dir: std::path::PathBuf,
}

impl Server {
    pub fn new(
        storage_dir: std::path::PathBuf,
        rate_limit_interval: Duration,
        link_ttl: Duration,
        session_idle: Duration,
        persistence: PersistenceHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            rate_limiter: RateLimiter::new(rate_limit_interval),
            link_broker: LinkBroker::new(link_ttl),
            persistence,
            session_idle,
            storage_dir,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session_idle_timeout(&self) -> Duration {
        self.session_idle
    }

    /// Registers every marker-file device and replays persisted tracking
    /// files, in last-modified order, before the server starts accepting
    /// connections.
    pub async fn recover(&self, storage_dir: &std::path::Path) -> std::io::Result<()> {
        crate::persistence::scan_storage_dir(storage_dir, &self.registry).await
    }

    /// Decodes and routes one fully-framed message from a TCP session.
    /// `reply_tx` is this session's writer mailbox, used both for direct
    /// replies and, once registered, for monitor fan-out. Returns `true` if
    /// the caller should close the connection after this call.
    pub async fn handle_tcp_message(
        &self,
        frame: &[u8],
        remote: SocketAddr,
        session_id: usize,
        reply_tx: &UnboundedSender<Bytes>,
        decoder: &mut Utf8Decoder,
    ) -> bool {
        let header = match header::read_header(frame) {
            Ok(h) => h,
            Err(err) => {
                warn!(
                    %remote,
                    %err,
                    frame_prefix = %hex::encode(&frame[..frame.len().min(16)]),
                    "closing connection on malformed header"
                );
                return true;
            }
        };

        let Ok(message_id) = MessageId::try_from(header.id) else {
            warn!(%remote, id = header.id, "ignoring unknown message id");
            return false;
        };

        metrics::message_dispatched(header.id);
        let remote_ip = RemoteAddr::Ip(remote.ip());

        match message_id {
            MessageId::Ping => false,

            MessageId::RegisterRequest => {
                if !self.rate_limiter.check(remote_ip, header.id, None) {
                    metrics::rate_limit_rejected();
                    return false;
                }
                self.handle_register_request(reply_tx).await
            }

            MessageId::TrackerLinkRequest => {
                if !self.rate_limiter.check(remote_ip, header.id, None) {
                    metrics::rate_limit_rejected();
                    return false;
                }
                self.handle_tracker_link_request(frame, reply_tx)
            }

            MessageId::MonitorLinkRequest => {
                let expect_stream_open = Some(MessageId::StreamOpenRequest as u16);
                if !self.rate_limiter.check(remote_ip, header.id, expect_stream_open) {
                    metrics::rate_limit_rejected();
                    return false;
                }
                self.handle_monitor_link_request(frame, reply_tx)
            }

            MessageId::StreamOpenRequest => {
                if !self.rate_limiter.check(remote_ip, header.id, None) {
                    metrics::rate_limit_rejected();
                    return false;
                }
                self.handle_stream_open_request(frame, session_id, reply_tx)
            }

            MessageId::ResyncRequest => {
                self.handle_resync_request(frame, reply_tx);
                false
            }

            MessageId::Tracking => {
                self.fuse_tracking(frame, Some(remote), decoder);
                false
            }

            MessageId::RegisterReply
            | MessageId::TrackerLinkReply
            | MessageId::MonitorLinkReply
            | MessageId::ResyncReply => {
                warn!(%remote, id = header.id, "ignoring a reply-only message id from a client");
                false
            }
        }
    }

    /// Decodes and routes one datagram. Only `Tracking` is meaningful over
    /// UDP; every other message id is logged and dropped.
    pub async fn handle_udp_message(&self, datagram: &[u8], remote: SocketAddr, decoder: &mut Utf8Decoder) {
        let header = match header::read_header(datagram) {
            Ok(h) => h,
            Err(err) => {
                warn!(
                    %remote,
                    %err,
                    datagram_prefix = %hex::encode(&datagram[..datagram.len().min(16)]),
                    "dropping datagram with malformed header"
                );
                return;
            }
        };
        if header.size as usize != datagram.len() {
            warn!(
                %remote,
                declared = header.size,
                actual = datagram.len(),
                "dropping datagram whose size field disagrees with its length"
            );
            return;
        }

        let Ok(message_id) = MessageId::try_from(header.id) else {
            warn!(%remote, id = header.id, "ignoring unknown message id over udp");
            return;
        };
        metrics::message_dispatched(header.id);

        if message_id == MessageId::Tracking {
            self.fuse_tracking(datagram, Some(remote), decoder);
        } else {
            warn!(%remote, id = header.id, "ignoring non-tracking message id over udp");
        }
    }

    async fn handle_register_request(&self, reply_tx: &UnboundedSender<Bytes>) -> bool {
        let device_id = DeviceId::new_random();
        if let Err(err) = registry::create_marker_file(&self.storage_dir, device_id).await {
            warn!(%err, device = %device_id, "failed to create marker file, closing without a reply");
            return true;
        }
        self.registry.insert(device_id, crate::device::DeviceState::new());

        let mut buf = vec![0u8; register_reply::SIZE];
        register_reply::encode(&mut buf, device_id);
        let _ = reply_tx.send(Bytes::from(buf));
        true
    }

    fn handle_tracker_link_request(&self, frame: &[u8], reply_tx: &UnboundedSender<Bytes>) -> bool {
        let device_id = match tracker_link_request::get_device_id(frame) {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "malformed tracker link request");
                return true;
            }
        };
        if !self.registry.contains(device_id) {
            warn!(device = %device_id, "tracker link request for an unknown device");
        }
        let code = self.link_broker.issue_for_tracker(device_id, &self.registry);

        let mut buf = vec![0u8; tracker_link_reply::SIZE];
        tracker_link_reply::encode(&mut buf, code);
        let _ = reply_tx.send(Bytes::from(buf));
        true
    }

    fn handle_monitor_link_request(&self, frame: &[u8], reply_tx: &UnboundedSender<Bytes>) -> bool {
        let code = match monitor_link_request::get_link_code(frame) {
            Ok(code) => code,
            Err(err) => {
                warn!(%err, "malformed monitor link request");
                return true;
            }
        };
        let device_id = self.link_broker.redeem_for_monitor(code).unwrap_or(DeviceId::ZERO);
        if device_id.is_zero() {
            warn!(code, "monitor link request named an unredeemable code");
        }

        let mut buf = vec![0u8; monitor_link_reply::SIZE];
        monitor_link_reply::encode(&mut buf, device_id);
        let _ = reply_tx.send(Bytes::from(buf));
        false
    }

    fn handle_stream_open_request(
        &self,
        frame: &[u8],
        session_id: usize,
        reply_tx: &UnboundedSender<Bytes>,
    ) -> bool {
        let device_id = match stream_open_request::get_device_id(frame) {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "malformed stream open request");
                return true;
            }
        };
        let Some(device) = self.registry.get(device_id) else {
            warn!(device = %device_id, "stream open request for an unknown device");
            return false;
        };

        device.add_subscriber(SubscriberHandle {
            session_id,
            sender: reply_tx.clone(),
        });
        self.registry.record_subscription(session_id, device_id);

        let snapshot = device.snapshot_fields();
        if !snapshot.is_empty() {
            let fields = snapshot.to_tlv_fields();
            let mut buf = vec![0u8; tracking_to_monitor::size(&fields)];
            tracking_to_monitor::encode(&mut buf, &fields);
            let _ = reply_tx.send(Bytes::from(buf));
        }
        false
    }

    fn handle_resync_request(&self, frame: &[u8], reply_tx: &UnboundedSender<Bytes>) {
        let (device_id, requested) = match resync_request::decode(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "malformed resync request");
                return;
            }
        };
        let Some(device) = self.registry.get(device_id) else {
            warn!(device = %device_id, "resync request for an unknown device");
            return;
        };

        let (ack, request) = device.build_resync_partitions(&requested);
        let mut buf = vec![0u8; resync_reply::size(ack.len(), request.len())];
        if resync_reply::encode(&mut buf, &ack, &request).is_some() {
            let _ = reply_tx.send(Bytes::from(buf));
        }
    }

    fn fuse_tracking(&self, frame: &[u8], remote: Option<SocketAddr>, decoder: &mut Utf8Decoder) {
        let started = Instant::now();
        let device_id = match tracking_to_server::get_device_id(frame) {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "malformed tracking message");
                return;
            }
        };
        if !self.registry.contains(device_id) {
            warn!(device = %device_id, "tracking message for an unknown device");
            return;
        }
        let sequence = match tracking_to_server::get_sequence(frame) {
            Ok(seq) => seq,
            Err(err) => {
                warn!(%err, "malformed tracking message");
                return;
            }
        };
        let tlv_body = match tracking_to_server::get_tlv_body(frame) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "malformed tracking message");
                return;
            }
        };

        let device = self.registry.get(device_id).expect("checked contains above");
        if let Some(addr) = remote {
            device.set_last_source_addr(addr);
        }
        device.record_sequence(sequence);

        let outcome = tlv::parse_tlvs(tlv_body);
        if let Some(err) = &outcome.error {
            metrics::broken_field();
            warn!(device = %device_id, %err, "broken field while applying tracking message");
        }
        for field in &outcome.fields {
            if let tracker_relay_protocol::TlvField::NetworkName { name, .. } = field {
                let rendered = decoder.decode(name).unwrap_or("<invalid-utf8>");
                tracing::debug!(device = %device_id, network = rendered, "observed network name");
            }
        }

        let applied = device.apply_tracking(&outcome.fields);

        if !applied.is_empty() && device.has_subscribers() {
            let fields = applied.to_tlv_fields();
            let mut buf = vec![0u8; tracking_to_monitor::size(&fields)];
            tracking_to_monitor::encode(&mut buf, &fields);
            let bytes = Bytes::from(buf);
            for subscriber in device.subscriber_snapshot() {
                let _ = subscriber.sender.send(bytes.clone());
            }
        }

        self.persistence.enqueue(frame.to_vec());
        metrics::fusion_latency(started);
    }
}
