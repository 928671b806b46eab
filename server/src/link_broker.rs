use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracker_relay_protocol::DeviceId;

use crate::registry::Registry;

struct LinkRequest {
    device_id: DeviceId,
    deadline: Instant,
}

struct Inner {
    by_code: HashMap<u32, LinkRequest>,
    // insertion order, for the expiry sweep; a refreshed code is not moved,
    // since the list stays short and short-lived regardless.
    order: VecDeque<u32>,
}

/// Short-lived map from numeric link-code to device identifier, brokering
/// a monitor↔tracker pairing without exposing the tracker's full
/// [`DeviceId`] to the monitor until redemption.
pub struct LinkBroker {
    inner: Mutex<Inner>,
    ttl: Duration,
    notify: Notify,
}

impl LinkBroker {
    pub fn new(ttl: Duration) -> Arc<Self> {
        let broker = Arc::new(Self {
            inner: Mutex::new(Inner {
                by_code: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            notify: Notify::new(),
        });
        let background = broker.clone();
        tokio::spawn(async move { background.run_expiry_loop().await });
        broker
    }

    /// Returns 0 (an invalid code, never drawn for a real request) if
    /// `device_id` is not registered. A retried request for the same
    /// device sees the same code with a refreshed deadline.
    pub fn issue_for_tracker(&self, device_id: DeviceId, registry: &Registry) -> u32 {
        if !registry.contains(device_id) {
            return 0;
        }

        let mut inner = self.inner.lock();
        if let Some((&code, request)) = inner
            .by_code
            .iter_mut()
            .find(|(_, request)| request.device_id == device_id)
        {
            request.deadline = Instant::now() + self.ttl;
            return code;
        }

        let mut rng = rand::thread_rng();
        let mut code = rng.gen_range(0..100_000u32);
        while code == 0 {
            code = rng.gen_range(0..100_000u32);
        }

        let was_empty = inner.order.is_empty();
        inner.order.push_back(code);
        inner.by_code.insert(
            code,
            LinkRequest {
                device_id,
                deadline: Instant::now() + self.ttl,
            },
        );
        drop(inner);
        if was_empty {
            self.notify.notify_one();
        }
        code
    }

    /// Linear search by code: the list is bounded and short-lived. On
    /// match, removes the entry (no refresh semantics, unlike issuance).
    pub fn redeem_for_monitor(&self, code: u32) -> Option<DeviceId> {
        let mut inner = self.inner.lock();
        let request = inner.by_code.remove(&code)?;
        inner.order.retain(|&c| c != code);
        Some(request.device_id)
    }

    async fn run_expiry_loop(self: Arc<Self>) {
        loop {
            let sleep_for = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                let Inner { by_code, order } = &mut *inner;
                order.retain(|code| !matches!(by_code.get(code), Some(r) if r.deadline <= now));
                by_code.retain(|_, request| request.deadline > now);
                inner
                    .by_code
                    .values()
                    .map(|request| request.deadline.saturating_duration_since(now))
                    .min()
            };

            match sleep_for {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_device_yields_the_invalid_sentinel() {
        let registry = Registry::new();
        let broker = LinkBroker::new(Duration::from_secs(60));
        assert_eq!(broker.issue_for_tracker(DeviceId::new_random(), &registry), 0);
    }

    #[tokio::test]
    async fn link_ceremony_round_trips_scenario_5() {
        let registry = Registry::new();
        let device_id = DeviceId::new_random();
        registry.insert_if_absent(device_id);

        let broker = LinkBroker::new(Duration::from_secs(60));
        let code = broker.issue_for_tracker(device_id, &registry);
        assert_ne!(code, 0);
        assert_eq!(broker.redeem_for_monitor(code), Some(device_id));
        assert_eq!(broker.redeem_for_monitor(code), None);
    }

    #[tokio::test]
    async fn a_retried_request_for_the_same_device_sees_the_same_code() {
        let registry = Registry::new();
        let device_id = DeviceId::new_random();
        registry.insert_if_absent(device_id);

        let broker = LinkBroker::new(Duration::from_secs(60));
        let first = broker.issue_for_tracker(device_id, &registry);
        let second = broker.issue_for_tracker(device_id, &registry);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn entries_expire_after_the_configured_ttl() {
        let registry = Registry::new();
        let device_id = DeviceId::new_random();
        registry.insert_if_absent(device_id);

        let broker = LinkBroker::new(Duration::from_millis(30));
        let code = broker.issue_for_tracker(device_id, &registry);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.redeem_for_monitor(code), None);
    }
}
