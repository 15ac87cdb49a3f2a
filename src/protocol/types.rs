//! Protocol type definitions
//!
//! These types describe the framed message protocol spoken between an
//! EchoLink client and the proxy. The wire format must stay compatible
//! with the official EchoLink client.

use crate::error::ProxyError;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Number of bytes in a frame header
pub const HEADER_LEN: usize = 9;

/// Maximum number of payload bytes the decoder will accept in one frame
pub const MAX_PAYLOAD_LEN: usize = 8192;

/// Maximum payload per proxy-to-client data frame
///
/// The official client can't handle messages from proxies which are
/// larger than 4096 or so.
pub const CHUNK_LEN: usize = 4096;

/// TCP port used for directory information on an EchoLink peer
pub const PEER_TCP_PORT: u16 = 5200;

/// UDP port used for data on an EchoLink peer
pub const PEER_UDP_DATA_PORT: u16 = 5199;

/// UDP port used for control information on an EchoLink peer
pub const PEER_UDP_CTRL_PORT: u16 = 5198;

/// Message types used in communication between the proxy and the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// The proxy should open a new TCP connection to the addressed peer
    ///
    /// Sent by: client. Expected data: 0 bytes.
    TcpOpen = 0x01,

    /// Data which has been sent or should be sent over the peer TCP connection
    ///
    /// The address field is ignored in client-to-proxy messages.
    ///
    /// Sent by: client or proxy. Expected data: 1 or more bytes.
    TcpData = 0x02,

    /// The peer TCP connection has been, or should be, closed
    ///
    /// Sent by: client or proxy. Expected data: 0 bytes.
    TcpClose = 0x03,

    /// The status of the peer TCP connection
    ///
    /// The data is four zero bytes when the TCP connection was opened
    /// successfully, and non-zero otherwise.
    ///
    /// Sent by: proxy. Expected data: 4 bytes.
    TcpStatus = 0x04,

    /// A datagram which has been or should be sent over the UDP data port
    ///
    /// Sent by: client or proxy. Expected data: 1 or more bytes.
    UdpData = 0x05,

    /// A datagram which has been or should be sent over the UDP control port
    ///
    /// Sent by: client or proxy. Expected data: 1 or more bytes.
    UdpCtrl = 0x06,

    /// Proxy system information
    ///
    /// The payload is a single [`SystemMsg`] code.
    ///
    /// Sent by: proxy. Expected data: 1 byte.
    System = 0x07,
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MsgType::TcpOpen),
            0x02 => Ok(MsgType::TcpData),
            0x03 => Ok(MsgType::TcpClose),
            0x04 => Ok(MsgType::TcpStatus),
            0x05 => Ok(MsgType::UdpData),
            0x06 => Ok(MsgType::UdpCtrl),
            0x07 => Ok(MsgType::System),
            other => Err(ProxyError::Protocol(format!(
                "unknown message type 0x{other:02x}"
            ))),
        }
    }
}

/// System messages sent by the proxy to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemMsg {
    /// The client has supplied the proxy with an incorrect password
    BadPassword = 1,

    /// The client's callsign is not allowed to use the proxy
    AccessDenied = 2,
}

/// Frame header preceding every message payload
///
/// On the wire the header is nine bytes: the message type, the IPv4
/// address in network byte order, and the payload size in little-endian
/// byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message carried by the frame
    pub msg_type: MsgType,

    /// IPv4 address of the peer this frame relates to, if applicable
    pub address: Ipv4Addr,

    /// Number of payload bytes following the header
    pub size: u32,
}

impl FrameHeader {
    /// Encode the header into its nine-byte wire form
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_type.into();
        buf[1..5].copy_from_slice(&self.address.octets());
        buf[5..9].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode a header from its nine-byte wire form
    ///
    /// Rejects unknown message types and payload sizes beyond
    /// [`MAX_PAYLOAD_LEN`]; either terminates the session.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProxyError> {
        let msg_type = MsgType::try_from(buf[0])?;
        let address = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
        let size = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);

        if size as usize > MAX_PAYLOAD_LEN {
            return Err(ProxyError::Protocol(format!(
                "oversized frame: {size} bytes (limit {MAX_PAYLOAD_LEN})"
            )));
        }

        Ok(FrameHeader {
            msg_type,
            address,
            size,
        })
    }
}

/// A complete protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Payload bytes, `header.size` of them
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a message type, address and payload
    pub fn new(msg_type: MsgType, address: Ipv4Addr, payload: Bytes) -> Self {
        Frame {
            header: FrameHeader {
                msg_type,
                address,
                size: payload.len() as u32,
            },
            payload,
        }
    }

    /// Create a TCP_DATA frame carrying bytes read from the peer
    pub fn tcp_data(address: Ipv4Addr, payload: Bytes) -> Self {
        Frame::new(MsgType::TcpData, address, payload)
    }

    /// Create a TCP_CLOSE frame
    pub fn tcp_close() -> Self {
        Frame::new(MsgType::TcpClose, Ipv4Addr::UNSPECIFIED, Bytes::new())
    }

    /// Create a TCP_STATUS frame with a big-endian status value
    ///
    /// Zero reports a successful peer connection, anything non-zero is
    /// an error code.
    pub fn tcp_status(status: u32) -> Self {
        Frame::new(
            MsgType::TcpStatus,
            Ipv4Addr::UNSPECIFIED,
            Bytes::copy_from_slice(&status.to_be_bytes()),
        )
    }

    /// Create a UDP_DATA frame carrying a datagram received from `address`
    pub fn udp_data(address: Ipv4Addr, payload: Bytes) -> Self {
        Frame::new(MsgType::UdpData, address, payload)
    }

    /// Create a UDP_CTRL frame carrying a datagram received from `address`
    pub fn udp_ctrl(address: Ipv4Addr, payload: Bytes) -> Self {
        Frame::new(MsgType::UdpCtrl, address, payload)
    }

    /// Create a SYSTEM frame carrying the given message code
    pub fn system(msg: SystemMsg) -> Self {
        Frame::new(
            MsgType::System,
            Ipv4Addr::UNSPECIFIED,
            Bytes::copy_from_slice(&[msg as u8]),
        )
    }

    /// Encode the frame into a contiguous byte buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
