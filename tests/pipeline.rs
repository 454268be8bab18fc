//! End-to-end correlation through the bus-wired pipeline: trigger in,
//! archive upload through the SFTP subsystem, syslog datagrams out.

mod common;

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use cip_relay::bus::Topic;
use cip_relay::config::{ListenerConfig, SyslogConfig, Transport};
use cip_relay::listener::NetworkListener;
use cip_relay::trigger::Validator;

use common::{capture, sftp_upload, tarball, wait_for, wire_pipeline};

const SECRET: &str = "s3cret";

async fn udp_collector() -> (UdpSocket, SyslogConfig) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = SyslogConfig {
        ip: "127.0.0.1".to_owned(),
        port: socket.local_addr().unwrap().port(),
        transport: Transport::Udp,
    };
    (socket, config)
}

async fn spawn_udp_listener(pipeline: &common::Pipeline) -> std::net::SocketAddr {
    let config = ListenerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        transport: Transport::Udp,
    };
    let listener =
        NetworkListener::new(config, Validator::new(SECRET, ""), pipeline.bus.clone());
    listener.spawn().await.expect("listener binds").local_addr
}

async fn send_trigger(addr: std::net::SocketAddr, payload: &[u8]) {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(payload, addr).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_trigger_to_syslog_burst() {
    let (collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(2, syslog);
    let listener_addr = spawn_udp_listener(&pipeline).await;

    send_trigger(listener_addr, b"10.0.0.7,04022024,E07,s3cret\n").await;

    // The datagram form carries a date only; the fault time is midnight.
    let event_id = "10.0.0.7_2024-04-02T00:00:00";
    assert!(
        wait_for(Duration::from_secs(2), || pipeline.store.get(event_id).is_some()).await,
        "event record not created"
    );

    let archive = tarball(&[(
        "events.log",
        b"[04/02/2024 00:00:00.100000] link down\n\
          [04/02/2024 00:00:00.900000] retry\n\
          [04/02/2024 00:00:01.500000] link up\n\
          [04/02/2024 00:00:30.000000] out of window\n" as &[u8],
    )]);
    sftp_upload(&pipeline, &format!("{event_id}.tar.gz"), &archive).await;

    let mut datagrams = Vec::new();
    let mut buf = [0u8; 2048];
    for _ in 0..3 {
        let len = timeout(Duration::from_secs(5), collector.recv(&mut buf))
            .await
            .expect("syslog datagram arrives")
            .unwrap();
        datagrams.push(String::from_utf8_lossy(&buf[..len]).into_owned());
    }

    for message in &datagrams {
        assert!(message.starts_with("<134>"), "{message}");
        assert!(message.contains(" 10.0.0.7 IWPLOGPARSER events: "), "{message}");
    }
    assert!(datagrams.iter().any(|m| m.contains("link down")));
    assert!(datagrams.iter().any(|m| m.contains("retry")));
    assert!(datagrams.iter().any(|m| m.contains("link up")));

    // The out-of-window line never leaves the pipeline.
    assert!(timeout(Duration::from_millis(300), collector.recv(&mut buf)).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_secret_creates_nothing() {
    let (collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(2, syslog);
    let created = capture(&pipeline.bus, Topic::CipEventCreated);
    let listener_addr = spawn_udp_listener(&pipeline).await;

    send_trigger(listener_addr, b"10.0.0.7,04022024,E07,WRONG\n").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(created.lock().unwrap().is_empty());
    assert!(pipeline.store.get("10.0.0.7_2024-04-02T00:00:00").is_none());

    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(200), collector.recv(&mut buf)).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_triggers_create_one_event() {
    let (_collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(2, syslog);
    let created = capture(&pipeline.bus, Topic::CipEventCreated);
    let listener_addr = spawn_udp_listener(&pipeline).await;

    send_trigger(listener_addr, b"10.0.0.7,04022024,E07,s3cret\n").await;
    send_trigger(listener_addr, b"10.0.0.7,04022024,E07,s3cret\n").await;

    assert!(
        wait_for(Duration::from_secs(2), || !created.lock().unwrap().is_empty()).await,
        "first trigger not processed"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(created.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_archive_stops_the_pipeline() {
    let (collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(2, syslog);
    let completed = capture(&pipeline.bus, Topic::LogProcessingCompleted);

    pipeline.store.add("10.0.0.7", "2024-04-02T00:45:01", "", "E07");
    sftp_upload(
        &pipeline,
        "10.0.0.7_2024-04-02T00:45:01.tar.gz",
        b"this is not a gzip stream",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(completed.lock().unwrap().is_empty());
    // The scratch directory was rolled back.
    assert!(pipeline.fs.listdir("/extracts").map(|e| e.is_empty()).unwrap_or(true));

    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(200), collector.recv(&mut buf)).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_filename_completes_without_syslog() {
    let (collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(2, syslog);
    let received = capture(&pipeline.bus, Topic::FileReceived);
    let completed = capture(&pipeline.bus, Topic::LogProcessingCompleted);

    let archive = tarball(&[("events.log", b"[04/02/2024 00:45:01.000000] x\n" as &[u8])]);
    sftp_upload(&pipeline, "random.tar.gz", &archive).await;

    assert!(
        wait_for(Duration::from_secs(2), || !completed.lock().unwrap().is_empty()).await,
        "processing did not complete"
    );
    assert_eq!(received.lock().unwrap().len(), 1);

    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(200), collector.recv(&mut buf)).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_window_completes_without_syslog() {
    let (collector, syslog) = udp_collector().await;
    let pipeline = wire_pipeline(1, syslog);
    let completed = capture(&pipeline.bus, Topic::LogProcessingCompleted);

    pipeline.store.add("10.0.0.7", "2024-04-02T00:45:01", "", "E07");
    let archive = tarball(&[(
        "events.log",
        b"[04/02/2024 08:00:00.000000] far away\n" as &[u8],
    )]);
    sftp_upload(&pipeline, "10.0.0.7_2024-04-02T00:45:01.tar.gz", &archive).await;

    assert!(
        wait_for(Duration::from_secs(2), || !completed.lock().unwrap().is_empty()).await,
        "processing did not complete"
    );

    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(200), collector.recv(&mut buf)).await.is_err());
}
