//! Concurrent dispatch, device fusion state, and ambient stack (metrics,
//! persistence) for the location-tracking relay binary. Split out as a
//! library so `tests/` can drive a real `Server` end to end without going
//! through `main`.

pub mod device;
pub mod dispatch;
pub mod link_broker;
pub mod metrics;
pub mod persistence;
pub mod rate_limiter;
pub mod registry;
pub mod session;
pub mod udp;

pub use dispatch::Server;
pub use registry::Registry;
