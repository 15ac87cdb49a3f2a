//! Proxy core: lifecycle, slot pool and acceptor
//!
//! A [`Proxy`] owns the client listener, one slot per configured
//! external address, and the directory registration hook. The host
//! drives it through the lifecycle: `new` → `open` → `start` →
//! repeated `process` calls → `shutdown` → `close`.

mod acl;
mod auth;
mod relay;
mod slot;

pub use acl::CallsignAcl;
pub use slot::ProxySlot;

use crate::config::Config;
use crate::error::ProxyError;
use crate::registration::RegistrationService;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::protocol::{PEER_UDP_CTRL_PORT, PEER_UDP_DATA_PORT};

/// State shared between the acceptor, the workers and the registration
/// hook
pub(crate) struct ProxyShared {
    /// All slots, in probe order
    pub(crate) slots: Vec<Arc<ProxySlot>>,

    /// Number of slots currently eligible to accept a client
    ///
    /// Set to the slot count by `start` and to zero by `shutdown`.
    pub(crate) usable_clients: AtomicUsize,

    /// Compiled callsign allow/deny patterns
    pub(crate) acl: CallsignAcl,

    /// Shared password clients authenticate against
    pub(crate) password: String,

    /// Directory registration hook
    pub(crate) registration: RegistrationService,
}

impl ProxyShared {
    /// Report the current occupancy to the registration service
    ///
    /// Called after every transition that could change either the used
    /// or the usable slot count.
    pub(crate) fn update_registration(&self) {
        let used = self.slots.iter().filter(|s| s.is_in_use()).count();
        let total = self.usable_clients.load(Ordering::SeqCst);
        self.registration.update(used, total);
    }
}

/// An EchoLink proxy instance
pub struct Proxy {
    config: Config,
    shared: Arc<ProxyShared>,
    listener: Option<TcpListener>,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: AtomicBool,
}

impl Proxy {
    /// Create a proxy from a validated configuration
    ///
    /// Compiles the callsign patterns and lays out one slot per
    /// external address. Configuration problems (bad pattern, bad
    /// address, missing external bind) fail here, before any socket is
    /// touched.
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;

        let acl = CallsignAcl::new(
            config.calls_allowed.as_deref(),
            config.calls_denied.as_deref(),
        )?;

        let mut slots = Vec::with_capacity(config.num_clients());

        let first = config
            .bind_addr_ext
            .as_deref()
            .map(parse_source_addr)
            .transpose()?;
        slots.push(Arc::new(ProxySlot::new(0, first)));

        for (i, addr) in config.bind_addr_ext_add.iter().enumerate() {
            slots.push(Arc::new(ProxySlot::new(
                i + 1,
                Some(parse_source_addr(addr)?),
            )));
        }

        let registration = RegistrationService::new(&config);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Proxy {
            shared: Arc::new(ProxyShared {
                slots,
                usable_clients: AtomicUsize::new(0),
                acl,
                password: config.password.clone(),
                registration,
            }),
            config,
            listener: None,
            workers: Vec::new(),
            shutdown_tx,
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// The slots this proxy manages
    pub fn slots(&self) -> &[Arc<ProxySlot>] {
        &self.shared.slots
    }

    /// Number of configured slots
    pub fn num_clients(&self) -> usize {
        self.shared.slots.len()
    }

    /// Number of slots currently eligible to accept a client
    pub fn usable_clients(&self) -> usize {
        self.shared.usable_clients.load(Ordering::SeqCst)
    }

    /// Address the client listener is bound to, once open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind the client listener
    pub async fn open(&mut self) -> Result<(), ProxyError> {
        let bind_addr = self.config.bind_addr.as_deref().unwrap_or("0.0.0.0");

        let listener = TcpListener::bind((bind_addr, self.config.port))
            .await
            .map_err(|e| {
                error!("Failed to open listening port: {}", e);
                ProxyError::from(e)
            })?;

        match self.config.bind_addr.as_deref() {
            None => info!("Listening for connections on port {}", self.config.port),
            Some(addr) => info!(
                "Listening for connections at {}:{}",
                addr, self.config.port
            ),
        }

        self.listener = Some(listener);

        Ok(())
    }

    /// Start the slot workers and the registration service
    ///
    /// Binds each slot's UDP sockets to its external address and spawns
    /// its worker task, then makes every slot usable. On failure the
    /// workers spawned so far are torn down again.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if let Err(e) = self.start_workers().await {
            let _ = self.shutdown_tx.send(());
            for worker in self.workers.drain(..) {
                let _ = worker.await;
            }
            return Err(e);
        }

        self.shared
            .usable_clients
            .store(self.shared.slots.len(), Ordering::SeqCst);

        self.shared.registration.start();
        self.shared.update_registration();

        Ok(())
    }

    async fn start_workers(&mut self) -> Result<(), ProxyError> {
        for slot in &self.shared.slots {
            let bind_ip = slot
                .source_addr()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

            let udp_data = bind_udp(slot, bind_ip, PEER_UDP_DATA_PORT, "data").await?;
            let udp_ctrl = bind_udp(slot, bind_ip, PEER_UDP_CTRL_PORT, "control").await?;

            self.workers.push(tokio::spawn(slot::run_worker(
                self.shared.clone(),
                slot.index(),
                udp_data,
                udp_ctrl,
                self.shutdown_tx.subscribe(),
            )));
        }

        Ok(())
    }

    /// Drive one acceptance cycle
    ///
    /// Blocks until a client connects, then probes the usable slots in
    /// order and hands the socket to the first idle one. When every
    /// slot is busy the connection is closed and the call still
    /// succeeds. A concurrent [`shutdown`](Proxy::shutdown) interrupts
    /// the wait with a transport error, which is the orderly
    /// termination signal for the host's process loop.
    pub async fn process(&self) -> Result<(), ProxyError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ProxyError::Config("proxy is not open".to_string()))?;

        debug!("Waiting for a client...");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "listener shut down",
            )));
        }
        let (stream, remote) = tokio::select! {
            _ = shutdown_rx.recv() => {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "listener shut down",
                )));
            }
            res = listener.accept() => res?,
        };

        info!("Incoming connection from {}.", remote);

        let usable = self
            .shared
            .usable_clients
            .load(Ordering::SeqCst)
            .min(self.shared.slots.len());

        let mut handoff = stream;
        for slot in &self.shared.slots[..usable] {
            match slot.accept(handoff) {
                Ok(()) => return Ok(()),
                Err(stream) => handoff = stream,
            }
        }

        info!("Dropping client because there are no available slots.");

        Ok(())
    }

    /// Make the proxy stop accepting clients
    ///
    /// Sets the usable slot count to zero, reports the change to the
    /// registration service and interrupts a blocked
    /// [`process`](Proxy::process) call. Never fails; existing sessions
    /// keep running until dropped.
    pub fn shutdown(&self) {
        debug!("Proxy shutdown requested.");

        self.shared.usable_clients.store(0, Ordering::SeqCst);
        self.shared.update_registration();

        self.is_shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Terminate every slot's current session
    pub fn drop_all(&self) {
        debug!("Dropping all clients...");

        for slot in &self.shared.slots {
            slot.drop_session();
        }
    }

    /// Stop everything and release the listener
    ///
    /// Stops registration with a final report, shuts down, drops all
    /// sessions and waits for the workers to finish.
    pub async fn close(&mut self) {
        self.shared.registration.stop().await;

        self.shutdown();
        self.drop_all();

        debug!("Closing client connections...");

        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        debug!("Closing listening connection...");

        self.listener = None;

        debug!("Proxy is down.");
    }
}

async fn bind_udp(
    slot: &Arc<ProxySlot>,
    bind_ip: IpAddr,
    port: u16,
    label: &str,
) -> Result<Arc<UdpSocket>, ProxyError> {
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port))
        .await
        .map_err(|e| {
            error!(
                "Failed to open UDP {} port ({}) for slot #{}: {}",
                label,
                port,
                slot.index(),
                e
            );
            ProxyError::from(e)
        })?;

    Ok(Arc::new(socket))
}

fn parse_source_addr(addr: &str) -> Result<Ipv4Addr, ProxyError> {
    addr.parse().map_err(|_| {
        ProxyError::Config(format!("invalid external bind address '{addr}'"))
    })
}
