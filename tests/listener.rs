//! Trigger listener behaviour over real sockets, both transports live on
//! one bus.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use cip_relay::bus::{Event, EventBus, Topic};
use cip_relay::config::{ListenerConfig, Transport};
use cip_relay::listener::NetworkListener;
use cip_relay::trigger::{self, Validator};

use common::{capture, wait_for};

const SECRET: &str = "s3cret";

async fn spawn(bus: &Arc<EventBus>, transport: Transport) -> std::net::SocketAddr {
    let config = ListenerConfig { host: "127.0.0.1".to_owned(), port: 0, transport };
    NetworkListener::new(config, Validator::new(SECRET, ""), bus.clone())
        .spawn()
        .await
        .expect("listener binds")
        .local_addr
}

fn received_ips(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            Event::NetworkDataReceived { ip, .. } => ip.clone(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_trigger_round_trip() {
    let bus = Arc::new(EventBus::new());
    let seen = capture(&bus, Topic::NetworkDataReceived);
    let addr = spawn(&bus, Transport::Tcp).await;

    let frame = trigger::encode_stream("192.0.2.5".parse().unwrap(), 1712018701, "E07", SECRET);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "tcp trigger not received"
    );
    let events = seen.lock().unwrap();
    match &events[0] {
        Event::NetworkDataReceived { ip, datetime, error_code, .. } => {
            assert_eq!(ip, "192.0.2.5");
            assert_eq!(datetime, "2024-04-02T00:45:01");
            assert_eq!(error_code, "E07");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_tcp_does_not_disturb_concurrent_udp() {
    let bus = Arc::new(EventBus::new());
    let seen = capture(&bus, Topic::NetworkDataReceived);
    let tcp_addr = spawn(&bus, Transport::Tcp).await;
    let udp_addr = spawn(&bus, Transport::Udp).await;

    // Garbage down the TCP connection, a valid trigger over UDP at the
    // same time.
    let tcp = tokio::spawn(async move {
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream.write_all(b"garbage that is not a trigger frame at all").await.unwrap();
        stream.shutdown().await.unwrap();
    });
    let udp = tokio::spawn(async move {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"10.0.0.7,04022024,E07,s3cret\n", udp_addr).await.unwrap();
    });
    tcp.await.unwrap();
    udp.await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "udp trigger not received"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let events = seen.lock().unwrap();
    assert_eq!(received_ips(&events), vec!["10.0.0.7"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_survives_malformed_frames() {
    let bus = Arc::new(EventBus::new());
    let seen = capture(&bus, Topic::NetworkDataReceived);
    let addr = spawn(&bus, Transport::Tcp).await;

    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"junk").await.unwrap();
        stream.shutdown().await.unwrap();
    }

    let frame = trigger::encode_stream("192.0.2.5".parse().unwrap(), 1712018701, "E07", SECRET);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "listener stopped serving after malformed frames"
    );
    assert_eq!(received_ips(&seen.lock().unwrap()), vec!["192.0.2.5"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_datagrams_are_independent() {
    let bus = Arc::new(EventBus::new());
    let seen = capture(&bus, Topic::NetworkDataReceived);
    let addr = spawn(&bus, Transport::Udp).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"not,a,trigger", addr).await.unwrap();
    client.send_to(b"10.0.0.7,04022024,E07,s3cret\n", addr).await.unwrap();
    client.send_to(b"10.0.0.8,04022024,E07,s3cret\n", addr).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await,
        "valid datagrams not all received"
    );
    assert_eq!(received_ips(&seen.lock().unwrap()), vec!["10.0.0.7", "10.0.0.8"]);
}
