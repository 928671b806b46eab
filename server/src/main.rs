use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

use tracker_relay_common::Config;
use tracker_relay::{dispatch::Server, persistence, session, udp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracker_relay_common::logging::init();

    let config = Config::parse_and_validate()?;
    info!(?config, "starting tracker relay");

    if let Ok(metrics_addr) = config.metrics_addr.parse::<SocketAddr>() {
        if let Err(err) = tracker_relay::metrics::install_exporter(metrics_addr) {
            warn!(%err, "failed to install metrics exporter, continuing without it");
        }
    } else {
        warn!(addr = %config.metrics_addr, "invalid --metrics-addr, continuing without metrics");
    }

    let persistence_handle = persistence::spawn_writer(config.storage_dir.clone());
    let server = Server::new(
        config.storage_dir.clone(),
        Duration::from_secs(config.rate_limit_interval_secs),
        Duration::from_secs(config.link_ttl_secs),
        Duration::from_secs(config.session_idle_secs),
        persistence_handle,
    );

    server.recover(&config.storage_dir).await?;
    info!(devices = server.registry().len(), "startup recovery complete");

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let udp_socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening on tcp and udp");

    let tcp_server = server.clone();
    let tcp_task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, remote)) => {
                    let server = tcp_server.clone();
                    tokio::spawn(async move { session::run(stream, remote, server).await });
                }
                Err(err) => {
                    error!(%err, "tcp accept failed");
                }
            }
        }
    });

    let udp_task = tokio::spawn(udp::run(udp_socket, server.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            tcp_task.abort();
            udp_task.abort();
        }
        _ = tcp_task => {
            error!("tcp accept loop exited unexpectedly");
        }
        _ = udp_task => {
            error!("udp loop exited unexpectedly");
        }
    }

    // give the persistence writer a moment to flush whatever was already
    // enqueued before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
