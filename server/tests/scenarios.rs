//! End-to-end scenarios driving a real `Server` over actual TCP/UDP sockets,
//! bound to ephemeral ports with a temporary storage directory.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tracker_relay::persistence::PersistenceHandle;
use tracker_relay::{dispatch::Server, session, udp};
use tracker_relay_protocol::header;
use tracker_relay_protocol::message_id::MessageId;
use tracker_relay_protocol::messages::{
    monitor_link_request, register_reply, register_request, resync_reply, resync_request,
    stream_open_request, tracker_link_reply, tracker_link_request, tracking_to_server,
};
use tracker_relay_protocol::{DeviceId, TlvFieldOwned};

async fn spawn_test_server() -> (SocketAddr, SocketAddr, tempfile::TempDir, std::sync::Arc<Server>) {
    let storage = tempfile::tempdir().unwrap();
    let persistence_sender: PersistenceHandle =
        tracker_relay::persistence::spawn_writer(storage.path().to_path_buf());

    let server = Server::new(
        storage.path().to_path_buf(),
        Duration::from_millis(50),
        Duration::from_secs(60),
        Duration::from_secs(30),
        persistence_sender,
    );
    server.recover(storage.path()).await.unwrap();

    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap();
    let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp_socket.local_addr().unwrap();

    let accept_server = server.clone();
    tokio::spawn(async move {
        loop {
            let (stream, remote) = tcp_listener.accept().await.unwrap();
            let server = accept_server.clone();
            tokio::spawn(async move { session::run(stream, remote, server).await });
        }
    });
    tokio::spawn(udp::run(udp_socket, server.clone()));

    (tcp_addr, udp_addr, storage, server)
}

async fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut header_buf = [0u8; header::HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let parsed = header::read_header(&header_buf).unwrap();
    let mut buf = vec![0u8; parsed.size as usize];
    buf[..header::HEADER_LEN].copy_from_slice(&header_buf);
    stream.read_exact(&mut buf[header::HEADER_LEN..]).await.unwrap();
    buf
}

#[tokio::test]
async fn scenario_1_register_assigns_a_fresh_device_and_closes() {
    let (tcp_addr, _udp_addr, _storage, _server) = spawn_test_server().await;

    let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
    let mut buf = vec![0u8; register_request::SIZE];
    register_request::encode(&mut buf);
    stream.write_all(&buf).await.unwrap();

    let reply = read_message(&mut stream).await;
    let device_id = register_reply::get_device_id(&reply).unwrap();
    assert!(!device_id.is_zero());

    // the server closes the connection after a RegisterReply.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).await.unwrap();
    assert_eq!(n, 0);
}

async fn register_device(tcp_addr: SocketAddr) -> DeviceId {
    let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
    let mut buf = vec![0u8; register_request::SIZE];
    register_request::encode(&mut buf);
    stream.write_all(&buf).await.unwrap();
    let reply = read_message(&mut stream).await;
    register_reply::get_device_id(&reply).unwrap()
}

async fn send_tracking(
    stream: &mut TcpStream,
    device_id: DeviceId,
    sequence: u64,
    fields: &[TlvFieldOwned],
) {
    let mut buf = vec![0u8; tracking_to_server::size(fields)];
    tracking_to_server::encode(&mut buf, device_id, sequence, fields);
    stream.write_all(&buf).await.unwrap();
}

#[tokio::test]
async fn scenario_2_battery_level_is_monotone_by_time() {
    let (tcp_addr, _udp_addr, _storage, server) = spawn_test_server().await;
    let device_id = register_device(tcp_addr).await;

    let mut tracker = TcpStream::connect(tcp_addr).await.unwrap();
    send_tracking(
        &mut tracker,
        device_id,
        1,
        &[TlvFieldOwned::BatteryLevel { time: 1000, level: 80 }],
    )
    .await;
    send_tracking(
        &mut tracker,
        device_id,
        2,
        &[TlvFieldOwned::BatteryLevel { time: 500, level: 95 }],
    )
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let device = server.registry().get(device_id).unwrap();
    let snapshot = device.snapshot_fields();
    assert_eq!(snapshot.battery, Some((1000, 80)));
}

#[tokio::test]
async fn scenario_3_tracking_stopped_is_guarded_by_newer_fields() {
    let (tcp_addr, _udp_addr, _storage, server) = spawn_test_server().await;
    let device_id = register_device(tcp_addr).await;

    let mut tracker = TcpStream::connect(tcp_addr).await.unwrap();
    send_tracking(
        &mut tracker,
        device_id,
        1,
        &[TlvFieldOwned::BatteryLevel { time: 2000, level: 50 }],
    )
    .await;
    send_tracking(
        &mut tracker,
        device_id,
        2,
        &[TlvFieldOwned::TrackingStopped { time: 1500 }],
    )
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let device = server.registry().get(device_id).unwrap();
    assert!(device.snapshot_fields().tracking_stopped.is_none());

    send_tracking(
        &mut tracker,
        device_id,
        3,
        &[TlvFieldOwned::TrackingStopped { time: 2500 }],
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.snapshot_fields().tracking_stopped, Some(2500));
}

#[tokio::test]
async fn scenario_4_resync_partitions_ack_and_request() {
    let (tcp_addr, _udp_addr, _storage, _server) = spawn_test_server().await;
    let device_id = register_device(tcp_addr).await;

    let mut tracker = TcpStream::connect(tcp_addr).await.unwrap();
    for seq in [10u64, 12, 15] {
        send_tracking(
            &mut tracker,
            device_id,
            seq,
            &[TlvFieldOwned::BatteryLevel { time: seq as i64, level: 1 }],
        )
        .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requested = vec![15u64, 12, 10, 5];
    let mut buf = vec![0u8; resync_request::size(requested.len())];
    resync_request::encode(&mut buf, device_id, &requested).unwrap();
    tracker.write_all(&buf).await.unwrap();

    let reply = read_message(&mut tracker).await;
    let (ack, request) = resync_reply::decode(&reply).unwrap();
    assert_eq!(ack, vec![15, 12, 10]);
    assert_eq!(request, vec![5]);
}

#[tokio::test]
async fn scenario_5_link_ceremony_pairs_a_monitor_to_a_tracker() {
    let (tcp_addr, _udp_addr, _storage, _server) = spawn_test_server().await;
    let device_id = register_device(tcp_addr).await;

    let mut tracker = TcpStream::connect(tcp_addr).await.unwrap();
    let mut buf = vec![0u8; tracker_link_request::SIZE];
    tracker_link_request::encode(&mut buf, device_id);
    tracker.write_all(&buf).await.unwrap();
    let reply = read_message(&mut tracker).await;
    let code = tracker_link_reply::get_link_code(&reply).unwrap();
    assert_ne!(code, 0);

    let mut monitor = TcpStream::connect(tcp_addr).await.unwrap();
    let mut req = vec![0u8; monitor_link_request::SIZE];
    monitor_link_request::encode(&mut req, code);
    monitor.write_all(&req).await.unwrap();
    let reply = read_message(&mut monitor).await;
    let resolved = tracker_relay_protocol::messages::monitor_link_reply::get_device_id(&reply).unwrap();
    assert_eq!(resolved, device_id);

    // subscribe using the resolved device id and confirm a live update arrives.
    let mut open = vec![0u8; stream_open_request::SIZE];
    stream_open_request::encode(&mut open, resolved);
    monitor.write_all(&open).await.unwrap();

    let mut tracker2 = TcpStream::connect(tcp_addr).await.unwrap();
    send_tracking(
        &mut tracker2,
        device_id,
        1,
        &[TlvFieldOwned::BatteryLevel { time: 10, level: 77 }],
    )
    .await;

    let update = read_message(&mut monitor).await;
    assert_eq!(
        tracker_relay_protocol::MessageId::try_from(header::read_header(&update).unwrap().id).unwrap(),
        MessageId::Tracking
    );
}

#[tokio::test]
async fn scenario_6_udp_out_of_order_locations_are_both_retained() {
    let (tcp_addr, udp_addr, _storage, server) = spawn_test_server().await;
    let device_id = register_device(tcp_addr).await;

    let udp_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut first = vec![
        0u8;
        tracking_to_server::size(&[TlvFieldOwned::Location {
            time: 100,
            lat: 2.0,
            lon: 2.0,
            alt: 2.0,
        }])
    ];
    tracking_to_server::encode(
        &mut first,
        device_id,
        8,
        &[TlvFieldOwned::Location {
            time: 100,
            lat: 2.0,
            lon: 2.0,
            alt: 2.0,
        }],
    );
    udp_client.send_to(&first, udp_addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut second = vec![
        0u8;
        tracking_to_server::size(&[TlvFieldOwned::Location {
            time: 50,
            lat: 1.0,
            lon: 1.0,
            alt: 1.0,
        }])
    ];
    tracking_to_server::encode(
        &mut second,
        device_id,
        7,
        &[TlvFieldOwned::Location {
            time: 50,
            lat: 1.0,
            lon: 1.0,
            alt: 1.0,
        }],
    );
    udp_client.send_to(&second, udp_addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let device = server.registry().get(device_id).unwrap();
    let (ack, request) = device.build_resync_partitions(&[6, 7, 8]);
    assert_eq!(ack, vec![7, 8]);
    assert_eq!(request, vec![6]);
}
