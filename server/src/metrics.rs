use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Installs the process-wide Prometheus recorder and starts its HTTP
/// listener. Call once, before accepting any connections.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

pub fn connection_opened() {
    metrics::gauge!("connections_active").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("connections_active").decrement(1.0);
}

pub fn message_dispatched(message_id: u16) {
    metrics::counter!("messages_dispatched_total", "id" => message_id.to_string()).increment(1);
}

pub fn rate_limit_rejected() {
    metrics::counter!("rate_limit_rejected_total").increment(1);
}

pub fn broken_field() {
    metrics::counter!("tracking_broken_fields_total").increment(1);
}

pub fn persistence_queue_depth(depth: usize) {
    metrics::gauge!("persistence_queue_depth").set(depth as f64);
}

pub fn fusion_latency(started: std::time::Instant) {
    metrics::histogram!("fusion_latency_us").record(started.elapsed().as_micros() as f64);
}
