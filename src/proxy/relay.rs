//! Per-session traffic relay
//!
//! Once a client is authorized, the relay multiplexes its framed TCP
//! connection with up to three EchoLink-facing peer sockets: one TCP
//! connection opened on demand, and the slot's two long-lived UDP
//! sockets.
//!
//! All frames bound for the client funnel through a single writer task
//! fed by a queue, so a frame is never interleaved with another. There
//! is no ordering between the peer sockets themselves.

use super::slot::DropSignal;
use crate::error::ProxyError;
use crate::protocol::{
    read_frame, write_frame, Frame, MsgType, CHUNK_LEN, PEER_TCP_PORT, PEER_UDP_CTRL_PORT,
    PEER_UDP_DATA_PORT,
};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Frames queued towards the client before backpressure kicks in
const FRAME_QUEUE_DEPTH: usize = 32;

/// How long a peer TCP connect may take before it is reported as failed
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay traffic for one authorized client until disconnect
///
/// Returns when the client connection is lost, the client violates the
/// protocol, or the slot's drop signal fires. The peer TCP connection
/// is closed on the way out; draining the UDP sockets is left to the
/// worker, which keeps them bound for the next session.
pub(crate) async fn run_session(
    stream: TcpStream,
    callsign: &str,
    source_addr: Option<Ipv4Addr>,
    udp_data: &Arc<UdpSocket>,
    udp_ctrl: &Arc<UdpSocket>,
    drop_signal: &Arc<DropSignal>,
) {
    let (mut reader, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);

    let writer_task = tokio::spawn(client_writer(
        rx,
        write_half,
        drop_signal.clone(),
        callsign.to_string(),
    ));
    let data_pump = tokio::spawn(udp_pump(
        udp_data.clone(),
        tx.clone(),
        MsgType::UdpData,
        callsign.to_string(),
        drop_signal.clone(),
    ));
    let ctrl_pump = tokio::spawn(udp_pump(
        udp_ctrl.clone(),
        tx.clone(),
        MsgType::UdpCtrl,
        callsign.to_string(),
        drop_signal.clone(),
    ));

    let mut session = Session {
        callsign: callsign.to_string(),
        source_addr,
        tx,
        udp_data: udp_data.clone(),
        udp_ctrl: udp_ctrl.clone(),
        peer_tcp: None,
    };

    loop {
        let frame = tokio::select! {
            _ = drop_signal.fired() => break,
            res = read_frame(&mut reader) => match res {
                Ok(frame) => frame,
                Err(e) if e.is_transport_lost() => break,
                Err(e) => {
                    error!(
                        "Failed to receive data from client '{}': {}",
                        session.callsign, e
                    );
                    break;
                }
            }
        };

        if let Err(e) = session.handle_frame(frame).await {
            if !e.is_transport_lost() {
                error!(
                    "Invalid data received from client '{}': {}",
                    session.callsign, e
                );
            }
            break;
        }
    }

    session.close_peer().await;
    data_pump.abort();
    ctrl_pump.abort();
    drop(session);

    let _ = writer_task.await;
}

/// Discard any datagrams queued on a UDP socket
///
/// Called between sessions so the next client starts clean.
pub(crate) fn drain_socket(socket: &UdpSocket) {
    let mut buf = [0u8; CHUNK_LEN];
    while socket.try_recv_from(&mut buf).is_ok() {}
}

/// State of one relay session
struct Session {
    callsign: String,
    source_addr: Option<Ipv4Addr>,
    tx: mpsc::Sender<Frame>,
    udp_data: Arc<UdpSocket>,
    udp_ctrl: Arc<UdpSocket>,
    peer_tcp: Option<PeerTcp>,
}

/// The peer TCP connection currently open for a session
struct PeerTcp {
    writer: OwnedWriteHalf,
    pump: JoinHandle<()>,
}

impl Session {
    /// Dispatch one frame received from the client
    ///
    /// An error return ends the session; everything recoverable is
    /// handled here.
    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ProxyError> {
        match frame.header.msg_type {
            MsgType::TcpOpen => self.process_tcp_open(frame.header.address).await,
            MsgType::TcpData => self.process_tcp_data(frame.payload).await,
            MsgType::TcpClose => {
                debug!("Processing TCP_CLOSE message from client '{}'", self.callsign);
                self.close_peer().await;
                Ok(())
            }
            MsgType::UdpData => {
                self.process_udp(&self.udp_data, frame, PEER_UDP_DATA_PORT, "UDP_DATA")
                    .await
            }
            MsgType::UdpCtrl => {
                self.process_udp(&self.udp_ctrl, frame, PEER_UDP_CTRL_PORT, "UDP_CTRL")
                    .await
            }
            MsgType::TcpStatus | MsgType::System => Err(ProxyError::Protocol(format!(
                "unexpected {:?} message from client",
                frame.header.msg_type
            ))),
        }
    }

    async fn process_tcp_open(&mut self, addr: Ipv4Addr) -> Result<(), ProxyError> {
        debug!("Processing TCP_OPEN message from client '{}'", self.callsign);

        // Only one peer TCP connection may exist at a time
        self.close_peer().await;

        let status = match self.connect_peer(addr).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(
                    "Failed to open TCP connection for client '{}': {}",
                    self.callsign, e
                );
                e.raw_os_error().map(|code| code as u32).unwrap_or(1)
            }
        };

        debug!(
            "Sending TCP_STATUS message ({}) to client '{}'",
            status, self.callsign
        );
        self.send_to_client(Frame::tcp_status(status)).await
    }

    async fn connect_peer(&mut self, addr: Ipv4Addr) -> io::Result<()> {
        let socket = TcpSocket::new_v4()?;
        if let Some(src) = self.source_addr {
            socket.bind(SocketAddr::new(IpAddr::V4(src), 0))?;
        }

        let target = SocketAddr::new(IpAddr::V4(addr), PEER_TCP_PORT);
        let stream = tokio::time::timeout(PEER_CONNECT_TIMEOUT, socket.connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer connect timed out"))??;

        let (read_half, write_half) = stream.into_split();
        let pump = tokio::spawn(tcp_pump(
            read_half,
            addr,
            self.tx.clone(),
            self.callsign.clone(),
        ));

        self.peer_tcp = Some(PeerTcp {
            writer: write_half,
            pump,
        });

        Ok(())
    }

    async fn process_tcp_data(&mut self, payload: Bytes) -> Result<(), ProxyError> {
        use tokio::io::AsyncWriteExt;

        debug!(
            "Processing TCP_DATA message ({} bytes) from client '{}'",
            payload.len(),
            self.callsign
        );

        if let Some(peer) = &mut self.peer_tcp {
            match peer.writer.write_all(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Error sending data to remote host: {}", e);
                    self.close_peer().await;
                }
            }
        }

        // Peer connection not open or lost: tell the client and discard
        self.send_to_client(Frame::tcp_close()).await
    }

    async fn process_udp(
        &self,
        socket: &UdpSocket,
        frame: Frame,
        port: u16,
        label: &str,
    ) -> Result<(), ProxyError> {
        debug!(
            "Processing {} message ({} bytes) from client '{}'",
            label,
            frame.payload.len(),
            self.callsign
        );

        let target = SocketAddr::new(IpAddr::V4(frame.header.address), port);
        if let Err(e) = socket.send_to(&frame.payload, target).await {
            warn!(
                "Failed to send {} packet of size {} for client '{}': {}",
                label,
                frame.payload.len(),
                self.callsign,
                e
            );
        }

        Ok(())
    }

    /// Queue a frame towards the client
    ///
    /// Fails when the writer task is gone, which means the client
    /// connection itself is dead.
    async fn send_to_client(&self, frame: Frame) -> Result<(), ProxyError> {
        self.tx.send(frame).await.map_err(|_| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client writer closed",
            ))
        })
    }

    /// Close the peer TCP connection, if open
    async fn close_peer(&mut self) {
        if let Some(peer) = self.peer_tcp.take() {
            peer.pump.abort();
            let _ = peer.pump.await;
        }
    }
}

/// Writer task: the only place the client socket is written
///
/// Serializing all writes through this task keeps every frame atomic
/// with respect to the others.
async fn client_writer(
    mut rx: mpsc::Receiver<Frame>,
    mut writer: OwnedWriteHalf,
    drop_signal: Arc<DropSignal>,
    callsign: String,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(
                "Client '{}' writer is returning due to a client connection error: {}",
                callsign, e
            );
            // The client connection is gone; end the whole session
            drop_signal.fire();
            break;
        }
    }
}

/// Pump datagrams from one of the slot's UDP sockets to the client
async fn udp_pump(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Frame>,
    msg_type: MsgType,
    callsign: String,
    drop_signal: Arc<DropSignal>,
) {
    let mut buf = vec![0u8; CHUNK_LEN];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let IpAddr::V4(ip) = from.ip() else {
                    continue;
                };

                let payload = Bytes::copy_from_slice(&buf[..len]);
                let frame = match msg_type {
                    MsgType::UdpCtrl => Frame::udp_ctrl(ip, payload),
                    _ => Frame::udp_data(ip, payload),
                };

                debug!(
                    "Sending {:?} message to client '{}' ({} bytes)",
                    msg_type, callsign, len
                );

                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // The UDP ports must stay usable while the client is
                // connected; shut the session down if we cannot read.
                info!(
                    "Failed to receive data on client '{}' {:?} socket: {}",
                    callsign, msg_type, e
                );
                drop_signal.fire();
                return;
            }
        }
    }
}

/// Pump bytes from the peer TCP connection to the client
async fn tcp_pump(
    mut reader: OwnedReadHalf,
    peer_addr: Ipv4Addr,
    tx: mpsc::Sender<Frame>,
    callsign: String,
) {
    let mut buf = vec![0u8; CHUNK_LEN];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                debug!(
                    "Sending TCP_DATA message to client '{}' ({} bytes)",
                    callsign, n
                );

                let frame = Frame::tcp_data(peer_addr, Bytes::copy_from_slice(&buf[..n]));
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                if !crate::error::is_transport_lost(&e) {
                    warn!(
                        "Failed to receive data on client '{}' TCP connection: {}",
                        callsign, e
                    );
                }
                break;
            }
        }
    }

    // Peer side ended: let the client know
    let _ = tx.send(Frame::tcp_close()).await;
}
