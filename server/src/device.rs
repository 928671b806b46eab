use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracker_relay_protocol::resync;
use tracker_relay_protocol::{DeviceId, TlvFieldOwned};

static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(1);

/// Identity used to dedupe subscribers and to remove one on connection
/// close, without the session and `DeviceState` needing to reference each
/// other directly (no weak-pointer upgrade dance, per the design notes).
pub fn next_session_id() -> usize {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A monitor session's mailbox. Sending never blocks the device mutex
/// holder: the session's own writer task drains this channel and pushes
/// bytes to the socket independently of fusion.
#[derive(Clone)]
pub struct SubscriberHandle {
    pub session_id: usize,
    pub sender: UnboundedSender<Bytes>,
}

impl PartialEq for SubscriberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}
impl Eq for SubscriberHandle {}
impl std::hash::Hash for SubscriberHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
    }
}

#[derive(Default)]
struct Inner {
    battery: Option<(i64, i16)>,
    network: Option<(i64, Vec<u8>)>,
    locations: BTreeMap<i64, (f64, f64, f64)>,
    tracking_stopped: i64,
    received: HashSet<u64>,
    subscribers: IndexSet<SubscriberHandle>,
    last_source_addr: Option<SocketAddr>,
}

impl Inner {
    fn battery_time(&self) -> i64 {
        self.battery.map(|(t, _)| t).unwrap_or(0)
    }

    fn network_time(&self) -> i64 {
        self.network.as_ref().map(|(t, _)| t).unwrap_or(0)
    }

    fn last_location_time(&self) -> Option<i64> {
        self.locations.keys().next_back().copied()
    }

    fn clear_tracking_stopped_if_superseded_by(&mut self, t: i64) {
        if self.tracking_stopped != 0 && self.tracking_stopped < t {
            self.tracking_stopped = 0;
        }
    }
}

/// One per registered [`DeviceId`], created on `RegisterRequest` (or on
/// startup for every existing marker file) and never destroyed for the
/// life of the process.
pub struct DeviceState {
    inner: Mutex<Inner>,
}

/// The set of TLVs newly applied by one `apply_tracking` call. This is
/// exactly what the fan-out/snapshot message should contain.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppliedFields {
    pub battery: Option<(i64, i16)>,
    pub network: Option<(i64, Vec<u8>)>,
    pub new_locations: Vec<(i64, f64, f64, f64)>,
    pub tracking_stopped: Option<i64>,
}

impl AppliedFields {
    pub fn is_empty(&self) -> bool {
        self.battery.is_none()
            && self.network.is_none()
            && self.new_locations.is_empty()
            && self.tracking_stopped.is_none()
    }

    /// The applied fields as TLVs, in the order the fan-out message
    /// carries them: battery, network, tracking-stopped, then locations in
    /// ascending time order (already guaranteed by the BTreeMap they came
    /// from).
    pub fn to_tlv_fields(&self) -> Vec<TlvFieldOwned> {
        let mut fields = Vec::new();
        if let Some((time, level)) = self.battery {
            fields.push(TlvFieldOwned::BatteryLevel { time, level });
        }
        if let Some((time, name)) = &self.network {
            fields.push(TlvFieldOwned::NetworkName {
                time: *time,
                name: name.clone(),
            });
        }
        if let Some(time) = self.tracking_stopped {
            fields.push(TlvFieldOwned::TrackingStopped { time });
        }
        for &(time, lat, lon, alt) in &self.new_locations {
            fields.push(TlvFieldOwned::Location { time, lat, lon, alt });
        }
        fields
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl DeviceState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `sequence` into the received set before any TLV is applied,
    /// so a ResyncRequest racing in right behind this message can already
    /// see it acked.
    pub fn record_sequence(&self, sequence: u64) {
        self.inner.lock().received.insert(sequence);
    }

    /// Applies every TLV in `fields`, in order, per the monotone-timestamp
    /// fusion rules. Returns exactly what was newly applied, so the caller
    /// can decide whether (and what) to fan out.
    pub fn apply_tracking(&self, fields: &[tracker_relay_protocol::TlvField<'_>]) -> AppliedFields {
        use tracker_relay_protocol::TlvField;

        let mut applied = AppliedFields::default();
        let mut inner = self.inner.lock();

        for field in fields {
            match *field {
                TlvField::BatteryLevel { time, level } => {
                    if time > inner.battery_time() {
                        inner.battery = Some((time, level));
                        inner.clear_tracking_stopped_if_superseded_by(time);
                        applied.battery = Some((time, level));
                    }
                }
                TlvField::NetworkName { time, name } => {
                    if time > inner.network_time() {
                        inner.network = Some((time, name.to_vec()));
                        inner.clear_tracking_stopped_if_superseded_by(time);
                        applied.network = Some((time, name.to_vec()));
                    }
                }
                TlvField::Location { time, lat, lon, alt } => {
                    let was_new = inner.locations.insert(time, (lat, lon, alt)).is_none();
                    inner.clear_tracking_stopped_if_superseded_by(time);
                    if was_new {
                        applied.new_locations.push((time, lat, lon, alt));
                    }
                }
                TlvField::TrackingStopped { time } => {
                    let guard_ok = time > inner.tracking_stopped
                        && time > inner.battery_time()
                        && time > inner.network_time()
                        && inner.last_location_time().map_or(true, |last| time > last);
                    if guard_ok {
                        inner.tracking_stopped = time;
                        applied.tracking_stopped = Some(time);
                    }
                }
            }
        }

        applied
    }

    pub fn set_last_source_addr(&self, addr: SocketAddr) {
        self.inner.lock().last_source_addr = Some(addr);
    }

    pub fn add_subscriber(&self, handle: SubscriberHandle) {
        self.inner.lock().subscribers.insert(handle);
    }

    pub fn remove_subscriber(&self, session_id: usize) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|handle| handle.session_id != session_id);
    }

    /// Subscriber handles copied out under the lock so sends can happen
    /// after it is released (§5: handlers never hold a device mutex across
    /// a socket write).
    pub fn subscriber_snapshot(&self) -> Vec<SubscriberHandle> {
        self.inner.lock().subscribers.iter().cloned().collect()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.inner.lock().subscribers.is_empty()
    }

    /// The fields a freshly-subscribed monitor should see: any set fields
    /// plus at most the most recent location.
    pub fn snapshot_fields(&self) -> AppliedFields {
        let inner = self.inner.lock();
        AppliedFields {
            battery: inner.battery,
            network: inner.network.clone(),
            tracking_stopped: if inner.tracking_stopped != 0 {
                Some(inner.tracking_stopped)
            } else {
                None
            },
            new_locations: inner
                .locations
                .iter()
                .next_back()
                .map(|(&t, &(lat, lon, alt))| vec![(t, lat, lon, alt)])
                .unwrap_or_default(),
        }
    }

    /// Partitions `requested` into ack (already received) and request
    /// (missing), preserving order within each partition.
    pub fn build_resync_partitions(&self, requested: &[u64]) -> (Vec<u64>, Vec<u64>) {
        let inner = self.inner.lock();
        resync::partition(requested, |seq| inner.received.contains(&seq))
    }
}
