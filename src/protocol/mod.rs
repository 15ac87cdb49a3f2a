//! Protocol module for the EchoLink proxy
//!
//! Implements the framed message protocol spoken over the client TCP
//! connection, and the MD5 challenge/response digests used during
//! authorization. The wire format must remain compatible with the
//! official EchoLink client.

mod codec;
mod digest;
mod types;

pub use codec::{read_frame, write_frame};
pub use digest::{md5, nonce_to_hex, password_response, DIGEST_LEN, NONCE_LEN};
pub use types::{
    Frame, FrameHeader, MsgType, SystemMsg, CHUNK_LEN, HEADER_LEN, MAX_PAYLOAD_LEN, PEER_TCP_PORT,
    PEER_UDP_CTRL_PORT, PEER_UDP_DATA_PORT,
};
