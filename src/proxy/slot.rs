//! Proxy slots and their worker tasks
//!
//! Each configured external address gets one slot, and each slot has a
//! fixed worker task. The acceptor hands a freshly accepted client
//! socket to an idle slot; the worker authorizes the client and then
//! relays traffic until either side disconnects.

use super::relay;
use super::ProxyShared;
use crate::error::ProxyError;
use crate::proxy::auth;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, warn};

/// Signal used to terminate a slot's current session from outside
///
/// Firing the signal interrupts every suspension point in the session
/// within a bounded time; the worker then returns the slot to idle.
#[derive(Debug)]
pub(crate) struct DropSignal {
    tx: watch::Sender<bool>,
}

impl DropSignal {
    pub(crate) fn new() -> Self {
        DropSignal {
            tx: watch::channel(false).0,
        }
    }

    /// Request termination of the current session
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    /// Re-arm the signal before a new session begins
    pub fn clear(&self) {
        let _ = self.tx.send(false);
    }

    /// Wait until the signal fires
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|&fired| fired).await;
    }
}

/// One proxy slot: an external address plus the client it serves
pub struct ProxySlot {
    /// Position in the slot pool, used in logs
    index: usize,

    /// External interface outbound peer sockets bind to; unspecified
    /// means the default route decides
    source_addr: Option<Ipv4Addr>,

    /// Client socket stored by the acceptor, taken by the worker
    pending: Mutex<Option<TcpStream>>,

    /// Whether this slot currently has a client attached
    in_use: AtomicBool,

    /// Callsign of the client this slot last served
    callsign: Mutex<String>,

    /// Wakes the worker after a handoff
    wake: Notify,

    /// Terminates the current session
    pub(crate) drop_signal: Arc<DropSignal>,
}

impl ProxySlot {
    pub(crate) fn new(index: usize, source_addr: Option<Ipv4Addr>) -> Self {
        ProxySlot {
            index,
            source_addr,
            pending: Mutex::new(None),
            in_use: AtomicBool::new(false),
            callsign: Mutex::new(String::new()),
            wake: Notify::new(),
            drop_signal: Arc::new(DropSignal::new()),
        }
    }

    /// Slot index within the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// External address this slot binds outbound sockets to
    pub fn source_addr(&self) -> Option<Ipv4Addr> {
        self.source_addr
    }

    /// Whether a client is currently attached to this slot
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Callsign of the client this slot last served
    pub fn callsign(&self) -> String {
        self.callsign.lock().unwrap().clone()
    }

    /// Hand a client socket to this slot
    ///
    /// Fails busy (returning the socket to the caller) while a client is
    /// attached. On success the slot is marked in use and its worker is
    /// woken; the acceptor does not touch the socket again.
    pub(crate) fn accept(&self, stream: TcpStream) -> Result<(), TcpStream> {
        let mut pending = self.pending.lock().unwrap();

        if self.in_use.load(Ordering::SeqCst) || pending.is_some() {
            return Err(stream);
        }

        self.in_use.store(true, Ordering::SeqCst);
        *pending = Some(stream);
        self.wake.notify_one();

        Ok(())
    }

    /// Terminate this slot's current session, if any
    pub(crate) fn drop_session(&self) {
        self.drop_signal.fire();
    }

    fn take_pending(&self) -> Option<TcpStream> {
        self.pending.lock().unwrap().take()
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

/// Worker task body: serve one client at a time until shutdown
///
/// The worker owns the slot's two UDP sockets, which stay bound for the
/// slot's whole lifetime; stale datagrams are drained between sessions.
pub(crate) async fn run_worker(
    shared: Arc<ProxyShared>,
    index: usize,
    udp_data: Arc<UdpSocket>,
    udp_ctrl: Arc<UdpSocket>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let slot = shared.slots[index].clone();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = slot.wake.notified() => {}
        }

        let Some(stream) = slot.take_pending() else {
            continue;
        };

        slot.drop_signal.clear();

        // A shutdown may have raced the handoff and fired the drop
        // signal before the clear above; the usable count is zeroed
        // before any drop is fired, so check it after re-arming
        if shared.usable_clients.load(Ordering::SeqCst) == 0 {
            drop(stream);
            slot.release();
            continue;
        }
        serve_client(&shared, &slot, stream, &udp_data, &udp_ctrl).await;

        relay::drain_socket(&udp_data);
        relay::drain_socket(&udp_ctrl);

        slot.release();
        shared.update_registration();
    }

    debug!("Worker #{} is returning cleanly", slot.index);
}

async fn serve_client(
    shared: &Arc<ProxyShared>,
    slot: &Arc<ProxySlot>,
    mut stream: TcpStream,
    udp_data: &Arc<UdpSocket>,
    udp_ctrl: &Arc<UdpSocket>,
) {
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    debug!("New connection - beginning authorization procedure");

    let callsign = tokio::select! {
        _ = slot.drop_signal.fired() => return,
        res = auth::authorize(&mut stream, &shared.password, &shared.acl) => match res {
            Ok(callsign) => callsign,
            Err(e) if e.is_transport_lost() => {
                warn!("Connection to client was lost before authorization could complete");
                return;
            }
            Err(e @ (ProxyError::BadPassword(_) | ProxyError::AccessDenied(_))) => {
                info!("{}. Dropping...", e);
                return;
            }
            Err(e) => {
                error!("Authorization failed for client '{}': {}", remote_addr, e);
                return;
            }
        }
    };

    *slot.callsign.lock().unwrap() = callsign.clone();
    shared.update_registration();

    info!(
        "Connected to client '{}', using external interface '{}'.",
        callsign,
        slot.source_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    );

    relay::run_session(
        stream,
        &callsign,
        slot.source_addr,
        udp_data,
        udp_ctrl,
        &slot.drop_signal,
    )
    .await;

    info!("Disconnected from client '{}'.", callsign);
}
