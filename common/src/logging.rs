use tracing_subscriber::EnvFilter;

/// Initializes the process-wide `tracing` subscriber: `info` by default,
/// with `tracker_relay=debug` unless `RUST_LOG` overrides it, set up before
/// anything else in `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tracker_relay=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
