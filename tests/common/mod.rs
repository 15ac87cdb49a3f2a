//! Test utilities for elproxy integration tests
//!
//! Every test proxy gets its own loopback addresses so the fixed
//! EchoLink ports (5200, 5199, 5198) never collide between tests
//! running in parallel.

use elproxy::config::parse_config;
use elproxy::protocol::md5;
use elproxy::proxy::Proxy;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Hands out distinct loopback host numbers to isolate tests
static NEXT_HOST: AtomicU8 = AtomicU8::new(1);

/// Addresses reserved for one test: the proxy's external interface and
/// a "peer" interface EchoLink nodes would live on
pub struct TestAddrs {
    /// External interface the proxy's slot binds to
    pub ext: Ipv4Addr,
    /// Address a fake EchoLink peer can bind its sockets to
    pub peer: Ipv4Addr,
}

/// Reserve a fresh pair of loopback addresses
pub fn alloc_addrs() -> TestAddrs {
    let host = NEXT_HOST.fetch_add(1, Ordering::SeqCst);
    TestAddrs {
        ext: Ipv4Addr::new(127, 0, 1, host),
        peer: Ipv4Addr::new(127, 0, 2, host),
    }
}

/// A running proxy under test
pub struct TestProxy {
    /// The proxy instance
    pub proxy: Arc<Proxy>,
    /// Address the client listener is bound to
    pub addr: SocketAddr,
    /// The proxy's external interface
    pub ext: Ipv4Addr,
    /// Peer-side loopback address reserved for this test
    pub peer: Ipv4Addr,
    /// Acceptor task driving `process` in a loop
    pub acceptor: JoinHandle<()>,
}

/// Build and start a proxy with the given password and optional
/// callsign patterns
pub async fn spawn_proxy(
    password: &str,
    allow: Option<&str>,
    deny: Option<&str>,
) -> TestProxy {
    let addrs = alloc_addrs();

    let mut config = format!(
        "Password = \"{password}\"\nBindAddress = \"{}\"\nPort = 0\nExternalBindAddress = \"{}\"\n",
        addrs.ext, addrs.ext
    );
    if let Some(allow) = allow {
        config.push_str(&format!("CallsignAllowList = \"{allow}\"\n"));
    }
    if let Some(deny) = deny {
        config.push_str(&format!("CallsignDenyList = \"{deny}\"\n"));
    }

    let mut proxy = Proxy::new(parse_config(&config).unwrap()).unwrap();
    proxy.open().await.unwrap();
    proxy.start().await.unwrap();

    let addr = proxy.local_addr().unwrap();
    let proxy = Arc::new(proxy);

    let acceptor = {
        let proxy = proxy.clone();
        tokio::spawn(async move { while proxy.process().await.is_ok() {} })
    };

    TestProxy {
        proxy,
        addr,
        ext: addrs.ext,
        peer: addrs.peer,
        acceptor,
    }
}

/// Connect to the proxy and complete the authorization handshake
///
/// Drives exactly what an EchoLink client sends: read the 8 hex nonce
/// bytes, then reply `CALLSIGN '\n' MD5(upper(password) + nonce)`.
pub async fn connect_and_authorize(
    test: &TestProxy,
    callsign: &str,
    password: &str,
) -> TcpStream {
    let mut stream = TcpStream::connect(test.addr).await.unwrap();

    let mut nonce = [0u8; 8];
    stream.read_exact(&mut nonce).await.unwrap();

    let mut material = password.to_uppercase().into_bytes();
    material.extend_from_slice(&nonce);

    let mut reply = callsign.as_bytes().to_vec();
    reply.push(b'\n');
    reply.extend_from_slice(&md5(&material));
    stream.write_all(&reply).await.unwrap();

    stream
}

/// Wait until `cond` holds, panicking after a couple of seconds
pub async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
