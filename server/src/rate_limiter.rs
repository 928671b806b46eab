use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// The protocol is only defined over IP transports; `Session`/the UDP loop
/// always construct `RemoteAddr::Ip`, but the admission check still models
/// (and rejects) the opaque case so the non-IP-remotes-are-rejected rule
/// has somewhere to live and be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAddr {
    Ip(IpAddr),
    Opaque,
}

struct Entry {
    first_seen: Instant,
    expected_follow_up: Option<u16>,
}

struct Inner {
    // Insertion order doubles as expiry order: `first_seen` is monotone
    // with insertion order because `Instant::now()` is monotone within a
    // process. The expiry sweep in `tick` depends on this and stops at
    // the first surviving entry.
    entries: IndexMap<IpAddr, Entry>,
}

/// Per-remote-IP admission filter for control requests, with a two-stage
/// "expected follow-up" exception: a request can name the one message id
/// allowed to bypass the interval exactly once (e.g. a `StreamOpenRequest`
/// immediately following a `MonitorLinkRequest` from the same address).
pub struct RateLimiter {
    inner: Mutex<Inner>,
    min_interval: Duration,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Arc<Self> {
        let limiter = Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
            }),
            min_interval,
            notify: Notify::new(),
        });
        let background = limiter.clone();
        tokio::spawn(async move { background.run_expiry_loop().await });
        limiter
    }

    pub fn check(&self, remote: RemoteAddr, message_id: u16, expected_next_id: Option<u16>) -> bool {
        let RemoteAddr::Ip(ip) = remote else {
            return false;
        };

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&ip) {
            if entry.expected_follow_up == Some(message_id) {
                entry.expected_follow_up = None;
                return true;
            }
            return entry.first_seen.elapsed() >= self.min_interval;
        }

        let was_empty = inner.entries.is_empty();
        inner.entries.insert(
            ip,
            Entry {
                first_seen: Instant::now(),
                expected_follow_up: expected_next_id,
            },
        );
        drop(inner);
        if was_empty {
            self.notify.notify_one();
        }
        true
    }

    async fn run_expiry_loop(self: Arc<Self>) {
        loop {
            let sleep_for = {
                let mut inner = self.inner.lock();
                let cutoff = Instant::now();
                while let Some((_, entry)) = inner.entries.first() {
                    if entry.first_seen + self.min_interval <= cutoff {
                        inner.entries.shift_remove_index(0);
                    } else {
                        break;
                    }
                }
                inner
                    .entries
                    .first()
                    .map(|(_, entry)| (entry.first_seen + self.min_interval).saturating_duration_since(cutoff))
            };

            match sleep_for {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => {
                    debug!("rate limiter idle, parking expiry task");
                    self.notify.notified().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> RemoteAddr {
        RemoteAddr::Ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)))
    }

    #[tokio::test]
    async fn rejects_opaque_remotes() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        assert!(!limiter.check(RemoteAddr::Opaque, 5, None));
    }

    #[tokio::test]
    async fn first_request_from_an_address_is_always_admitted() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        assert!(limiter.check(addr(1), 5, None));
    }

    #[tokio::test]
    async fn second_request_within_interval_is_rejected_unless_expected_follow_up() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        assert!(limiter.check(addr(2), 9, Some(11)));
        assert!(!limiter.check(addr(2), 5, None));
        assert!(limiter.check(addr(2), 11, None));
        // the follow-up exception is single-use
        assert!(!limiter.check(addr(2), 11, None));
    }

    #[tokio::test]
    async fn request_is_admitted_again_once_the_interval_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        assert!(limiter.check(addr(3), 5, None));
        assert!(!limiter.check(addr(3), 5, None));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check(addr(3), 5, None));
    }
}
