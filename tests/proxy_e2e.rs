//! End-to-end tests driving a real proxy over loopback
//!
//! Each test gets its own loopback addresses (see `common`), so the
//! fixed EchoLink peer ports can be bound freely.

mod common;

use common::{connect_and_authorize, spawn_proxy, wait_for};
use elproxy::protocol::{read_frame, Frame, MsgType};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn successful_auth_marks_slot_in_use() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let stream = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    wait_for(|| test.proxy.slots()[0].is_in_use(), "slot to become in use").await;

    assert_eq!(test.proxy.usable_clients(), 1);
    assert_eq!(test.proxy.slots()[0].callsign(), "W1AW");

    // Dropping the client releases the slot again
    drop(stream);
    wait_for(|| !test.proxy.slots()[0].is_in_use(), "slot to be released").await;
}

#[tokio::test]
async fn wrong_password_gets_fixed_system_frame() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let mut stream = TcpStream::connect(test.addr).await.unwrap();

    let mut nonce = [0u8; 8];
    stream.read_exact(&mut nonce).await.unwrap();

    // Callsign plus a digest that cannot match
    let mut reply = b"W1AW\n".to_vec();
    reply.extend_from_slice(&[0u8; 16]);
    stream.write_all(&reply).await.unwrap();

    let mut frame = [0u8; 10];
    stream.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x07, 0, 0, 0, 0, 0x01, 0, 0, 0, 0x01]);

    // ... and the connection is closed
    assert_eq!(stream.read(&mut frame).await.unwrap(), 0);

    // The slot went back to idle
    wait_for(|| !test.proxy.slots()[0].is_in_use(), "slot to be released").await;
}

#[tokio::test]
async fn denied_callsign_gets_fixed_system_frame() {
    let test = spawn_proxy("PASSWORD", Some("^[A-Z0-9]+$"), Some("^BAD1$")).await;

    let mut stream = connect_and_authorize(&test, "BAD1", "PASSWORD").await;

    let mut frame = [0u8; 10];
    stream.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x07, 0, 0, 0, 0, 0x01, 0, 0, 0, 0x02]);

    assert_eq!(stream.read(&mut frame).await.unwrap(), 0);
}

#[tokio::test]
async fn second_client_is_dropped_when_all_slots_busy() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let _active = connect_and_authorize(&test, "W1AW", "PASSWORD").await;
    wait_for(|| test.proxy.slots()[0].is_in_use(), "slot to become in use").await;

    // The second connection is accepted, then immediately closed
    // without ever receiving a nonce
    let mut second = TcpStream::connect(test.addr).await.unwrap();
    let mut nonce = [0u8; 8];
    let result = timeout(Duration::from_secs(2), second.read_exact(&mut nonce)).await;
    assert!(
        result.expect("read did not complete").is_err(),
        "second client should not be served"
    );
}

#[tokio::test]
async fn tcp_open_connects_to_peer_and_relays() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    // A fake EchoLink peer
    let peer_listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(test.peer), 5200))
        .await
        .unwrap();

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    // Ask the proxy to open a TCP connection to the peer
    client
        .write_all(&Frame::new(MsgType::TcpOpen, test.peer, bytes::Bytes::new()).encode())
        .await
        .unwrap();

    let (mut peer_conn, peer_seen_addr) = peer_listener.accept().await.unwrap();

    // The proxy connects from its external interface
    assert_eq!(peer_seen_addr.ip(), IpAddr::V4(test.ext));

    // TCP_STATUS with a four-byte zero payload signals success
    let status = read_frame(&mut client).await.unwrap();
    assert_eq!(status.header.msg_type, MsgType::TcpStatus);
    assert_eq!(status.payload.as_ref(), &[0, 0, 0, 0]);

    // Peer-to-client data becomes TCP_DATA frames
    peer_conn.write_all(b"DIRECTORY").await.unwrap();
    let data = read_frame(&mut client).await.unwrap();
    assert_eq!(data.header.msg_type, MsgType::TcpData);
    assert_eq!(data.header.address, test.peer);
    assert_eq!(data.payload.as_ref(), b"DIRECTORY");

    // Client-to-peer data flows through the open connection
    client
        .write_all(
            &Frame::tcp_data(test.peer, bytes::Bytes::from_static(b"query")).encode(),
        )
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    peer_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"query");

    // Peer hangup is reported as TCP_CLOSE
    drop(peer_conn);
    let close = read_frame(&mut client).await.unwrap();
    assert_eq!(close.header.msg_type, MsgType::TcpClose);
}

#[tokio::test]
async fn tcp_open_failure_reports_nonzero_status() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    // Nobody is listening on the peer address
    client
        .write_all(&Frame::new(MsgType::TcpOpen, test.peer, bytes::Bytes::new()).encode())
        .await
        .unwrap();

    let status = read_frame(&mut client).await.unwrap();
    assert_eq!(status.header.msg_type, MsgType::TcpStatus);
    assert_eq!(status.payload.len(), 4);
    assert_ne!(status.payload.as_ref(), &[0, 0, 0, 0]);
}

#[tokio::test]
async fn tcp_data_without_open_replies_close() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    client
        .write_all(&Frame::tcp_data(test.peer, bytes::Bytes::from_static(b"stray")).encode())
        .await
        .unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.msg_type, MsgType::TcpClose);
}

#[tokio::test]
async fn udp_data_round_trip() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let peer = UdpSocket::bind(SocketAddr::new(IpAddr::V4(test.peer), 5199))
        .await
        .unwrap();

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    // Client datagram is sent to the peer's UDP data port from the
    // slot's external address
    client
        .write_all(&Frame::udp_data(test.peer, bytes::Bytes::from_static(b"ping")).encode())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, SocketAddr::new(IpAddr::V4(test.ext), 5199));

    // Peer reply comes back as a UDP_DATA frame carrying the peer's
    // address
    peer.send_to(b"pong", from).await.unwrap();
    let frame = read_frame(&mut client).await.unwrap();
    assert_eq!(frame.header.msg_type, MsgType::UdpData);
    assert_eq!(frame.header.address, test.peer);
    assert_eq!(frame.payload.as_ref(), b"pong");
}

#[tokio::test]
async fn udp_ctrl_round_trip() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let peer = UdpSocket::bind(SocketAddr::new(IpAddr::V4(test.peer), 5198))
        .await
        .unwrap();

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    client
        .write_all(&Frame::udp_ctrl(test.peer, bytes::Bytes::from_static(b"ctrl?")).encode())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ctrl?");
    assert_eq!(from, SocketAddr::new(IpAddr::V4(test.ext), 5198));

    peer.send_to(b"ctrl!", from).await.unwrap();
    let frame = read_frame(&mut client).await.unwrap();
    assert_eq!(frame.header.msg_type, MsgType::UdpCtrl);
    assert_eq!(frame.header.address, test.peer);
    assert_eq!(frame.payload.as_ref(), b"ctrl!");
}

#[tokio::test]
async fn shutdown_unblocks_acceptor_and_close_completes() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    // Keep a session running so close() has something to drop
    let mut active = connect_and_authorize(&test, "W1AW", "PASSWORD").await;
    wait_for(|| test.proxy.slots()[0].is_in_use(), "slot to become in use").await;

    test.proxy.shutdown();
    assert_eq!(test.proxy.usable_clients(), 0);

    // The acceptor loop observes the shutdown and exits
    timeout(Duration::from_secs(2), test.acceptor)
        .await
        .expect("acceptor did not unblock")
        .unwrap();

    // With the acceptor gone the proxy handle is unique again
    let mut proxy = Arc::try_unwrap(test.proxy).ok().expect("proxy still shared");
    timeout(Duration::from_secs(5), proxy.close())
        .await
        .expect("close did not complete");

    assert!(proxy.slots().iter().all(|s| !s.is_in_use()));
    assert_eq!(proxy.usable_clients(), 0);

    // The dropped session closed the client connection
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), active.read(&mut buf))
        .await
        .expect("client read did not complete")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn oversized_frame_terminates_session() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let mut client = connect_and_authorize(&test, "W1AW", "PASSWORD").await;

    // Header advertising a payload beyond the decoder's ceiling
    let mut raw = vec![0x02u8];
    raw.extend_from_slice(&[0, 0, 0, 0]);
    raw.extend_from_slice(&(u32::MAX).to_le_bytes());
    client.write_all(&raw).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client read did not complete")
        .unwrap_or(0);
    assert_eq!(n, 0, "session should be closed after an oversized frame");

    wait_for(|| !test.proxy.slots()[0].is_in_use(), "slot to be released").await;
}

#[tokio::test]
async fn slot_serves_clients_sequentially() {
    let test = spawn_proxy("PASSWORD", None, None).await;

    let first = connect_and_authorize(&test, "W1AW", "PASSWORD").await;
    wait_for(|| test.proxy.slots()[0].is_in_use(), "first session").await;
    drop(first);
    wait_for(|| !test.proxy.slots()[0].is_in_use(), "first release").await;

    let _second = connect_and_authorize(&test, "K1ABC", "PASSWORD").await;
    wait_for(|| test.proxy.slots()[0].is_in_use(), "second session").await;
    assert_eq!(test.proxy.slots()[0].callsign(), "K1ABC");
}
