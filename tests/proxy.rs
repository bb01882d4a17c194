//! End-to-end tests driving a real proxy over localhost sockets.
//!
//! An in-test listener plays the upstream broker, a raw `TcpStream` plays
//! the MQTT client, and the `ProxyHandle` plays the operator.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use mitmqtt::mqtt::Direction;
use mitmqtt::proxy::{Proxy, ProxyHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

/// CONNECT, clean session, keepalive 60, empty client id.
const CONNECT: [u8; 14] = [
    0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
];

/// CONNACK, connection accepted.
const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// PUBLISH QoS 0, topic "test", payload "hi".
const PUBLISH: [u8; 10] = [0x30, 0x08, 0x00, 0x04, b't', b'e', b's', b't', b'h', b'i'];

#[derive(Debug)]
struct Capture {
    direction: Direction,
    label: &'static str,
    summary: String,
}

struct TestProxy {
    handle: ProxyHandle,
    proxy_addr: SocketAddr,
    broker: TcpListener,
    captures: mpsc::UnboundedReceiver<Capture>,
}

async fn spawn_proxy() -> TestProxy {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap();

    let mut proxy = Proxy::new();
    proxy.set_broker_config("127.0.0.1", broker_addr.port());

    let (capture_tx, captures) = mpsc::unbounded_channel();
    proxy.set_packet_callback(move |direction, packet| {
        let _ = capture_tx.send(Capture {
            direction,
            label: packet.type_label(),
            summary: packet.summary(),
        });
    });

    let proxy_addr = proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let handle = proxy.handle();

    tokio::spawn(async move { proxy.run().await });

    TestProxy {
        handle,
        proxy_addr,
        broker,
        captures,
    }
}

/// Connect a client through the proxy and complete the CONNECT/CONNACK
/// round trip against the in-test broker.
async fn open_session(t: &mut TestProxy) -> (TcpStream, TcpStream) {
    let mut client = TcpStream::connect(t.proxy_addr).await.unwrap();
    client.write_all(&CONNECT).await.unwrap();

    let (mut upstream, _) = timeout(TIMEOUT, t.broker.accept()).await.unwrap().unwrap();

    let mut forwarded = [0u8; CONNECT.len()];
    timeout(TIMEOUT, upstream.read_exact(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, CONNECT, "CONNECT was not forwarded byte-exact");

    upstream.write_all(&CONNACK).await.unwrap();

    let mut acked = [0u8; CONNACK.len()];
    timeout(TIMEOUT, client.read_exact(&mut acked))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acked, CONNACK, "CONNACK was not relayed byte-exact");

    (client, upstream)
}

async fn next_capture(rx: &mut mpsc::UnboundedReceiver<Capture>) -> Capture {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a capture")
        .expect("capture channel closed")
}

#[tokio::test]
async fn connect_round_trip_is_captured_in_order() {
    let mut t = spawn_proxy().await;
    let _session = open_session(&mut t).await;

    let first = next_capture(&mut t.captures).await;
    assert_eq!(first.direction, Direction::ClientToBroker);
    assert_eq!(first.label, "CONNECT");
    assert_eq!(first.summary, "");

    let second = next_capture(&mut t.captures).await;
    assert_eq!(second.direction, Direction::BrokerToClient);
    assert_eq!(second.label, "CONNACK");
    assert_eq!(second.summary, "");
}

#[tokio::test]
async fn publish_is_forwarded_byte_exact_and_summarized() {
    let mut t = spawn_proxy().await;
    let (mut client, mut upstream) = open_session(&mut t).await;

    client.write_all(&PUBLISH).await.unwrap();

    let mut forwarded = [0u8; PUBLISH.len()];
    timeout(TIMEOUT, upstream.read_exact(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, PUBLISH);

    // CONNECT, CONNACK, then the PUBLISH.
    next_capture(&mut t.captures).await;
    next_capture(&mut t.captures).await;
    let capture = next_capture(&mut t.captures).await;

    assert_eq!(capture.direction, Direction::ClientToBroker);
    assert_eq!(capture.label, "PUBLISH");
    assert_eq!(capture.summary, "Topic: test, Payload: hi");
}

#[tokio::test]
async fn inject_publish_to_client() {
    let mut t = spawn_proxy().await;
    let (mut client, _upstream) = open_session(&mut t).await;

    next_capture(&mut t.captures).await;
    next_capture(&mut t.captures).await;

    t.handle
        .inject_packet("a/b", Bytes::from_static(b"X"), true)
        .await
        .unwrap();

    let mut injected = [0u8; 8];
    timeout(TIMEOUT, client.read_exact(&mut injected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(injected, [0x30, 0x06, 0x00, 0x03, 0x61, 0x2F, 0x62, 0x58]);

    // The injection itself must not create a capture entry.
    assert!(t.captures.try_recv().is_err());
}

#[tokio::test]
async fn inject_publish_to_broker() {
    let mut t = spawn_proxy().await;
    let (_client, mut upstream) = open_session(&mut t).await;

    t.handle
        .inject_packet("a/b", Bytes::from_static(b"X"), false)
        .await
        .unwrap();

    let mut injected = [0u8; 8];
    timeout(TIMEOUT, upstream.read_exact(&mut injected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(injected, [0x30, 0x06, 0x00, 0x03, 0x61, 0x2F, 0x62, 0x58]);
}

#[tokio::test]
async fn replay_captured_publish_to_client() {
    let mut t = spawn_proxy().await;
    let (mut client, mut upstream) = open_session(&mut t).await;

    client.write_all(&PUBLISH).await.unwrap();

    // Once the broker has the bytes, the capture entry exists.
    let mut forwarded = [0u8; PUBLISH.len()];
    timeout(TIMEOUT, upstream.read_exact(&mut forwarded))
        .await
        .unwrap()
        .unwrap();

    // Captures: 0 = CONNECT, 1 = CONNACK, 2 = PUBLISH.
    t.handle.replay_packet(2).await.unwrap();

    let mut replayed = [0u8; PUBLISH.len()];
    timeout(TIMEOUT, client.read_exact(&mut replayed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed, PUBLISH);
}

#[tokio::test]
async fn second_connect_does_not_redial_the_broker() {
    let mut t = spawn_proxy().await;
    let (mut client, mut upstream) = open_session(&mut t).await;

    client.write_all(&CONNECT).await.unwrap();

    // The duplicate CONNECT is forwarded on the existing broker socket...
    let mut forwarded = [0u8; CONNECT.len()];
    timeout(TIMEOUT, upstream.read_exact(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, CONNECT);

    // ...and no second upstream connection appears.
    assert!(
        timeout(Duration::from_millis(200), t.broker.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn broker_eof_tears_down_the_pair() {
    let mut t = spawn_proxy().await;
    let (mut client, upstream) = open_session(&mut t).await;

    drop(upstream);

    // The pair shuts the client side down; a clean EOF or a reset are both
    // acceptable ways to observe it.
    let mut buf = [0u8; 16];
    match timeout(TIMEOUT, client.read(&mut buf)).await.unwrap() {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected teardown, read {n} bytes"),
    }

    // Operator actions against the dead pair must stay no-ops.
    t.handle
        .inject_packet("a/b", Bytes::from_static(b"X"), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn client_data_before_connect_tears_down_the_pair() {
    let mut t = spawn_proxy().await;

    let mut client = TcpStream::connect(t.proxy_addr).await.unwrap();
    client.write_all(&PUBLISH).await.unwrap();

    let mut buf = [0u8; 16];
    match timeout(TIMEOUT, client.read(&mut buf)).await.unwrap() {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected teardown, read {n} bytes"),
    }

    // The chunk was still captured before the pair went down.
    let capture = next_capture(&mut t.captures).await;
    assert_eq!(capture.direction, Direction::ClientToBroker);
    assert_eq!(capture.label, "PUBLISH");
}

#[tokio::test]
async fn stop_closes_listener_and_pairs() {
    let mut t = spawn_proxy().await;
    let (mut client, _upstream) = open_session(&mut t).await;

    t.handle.stop().await.unwrap();

    // The live pair is torn down...
    let mut buf = [0u8; 16];
    match timeout(TIMEOUT, client.read(&mut buf)).await.unwrap() {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected teardown, read {n} bytes"),
    }

    // ...and the listener is gone.
    assert!(TcpStream::connect(t.proxy_addr).await.is_err());
}

#[tokio::test]
async fn start_again_after_stop() {
    let mut t = spawn_proxy().await;
    let (mut client, _upstream) = open_session(&mut t).await;

    t.handle.stop().await.unwrap();

    let mut buf = [0u8; 16];
    let _ = timeout(TIMEOUT, client.read(&mut buf)).await.unwrap();

    t.proxy_addr = t
        .handle
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    // A fresh session relays end to end again.
    let _session = open_session(&mut t).await;
}

#[tokio::test]
async fn operator_actions_without_a_pair_are_noops() {
    let t = spawn_proxy().await;

    t.handle
        .inject_packet("a/b", Bytes::from_static(b"X"), true)
        .await
        .unwrap();
    t.handle.replay_packet(99).await.unwrap();
    t.handle.clear_captures().await.unwrap();
}

#[tokio::test]
async fn start_tls_without_certificate_fails() {
    let t = spawn_proxy().await;

    let err = t
        .handle
        .start_tls("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no TLS certificate configured"));
}
