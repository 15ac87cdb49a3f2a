//! Frame codec for the client control channel
//!
//! Reads and writes [`Frame`]s over any async stream. Every frame is a
//! nine-byte header followed by `size` payload bytes; see
//! [`types`](super::types) for the header layout.

use super::types::{Frame, FrameHeader, HEADER_LEN};
use crate::error::ProxyError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame from the stream
///
/// Blocks until the full header and payload have arrived. Fails with
/// [`ProxyError::Protocol`] on an unknown message type or an oversized
/// payload, and with [`ProxyError::Io`] when the stream is lost.
pub async fn read_frame<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Frame, ProxyError> {
    let mut hdr = [0u8; HEADER_LEN];
    conn.read_exact(&mut hdr).await?;

    let header = FrameHeader::decode(&hdr)?;

    let mut payload = vec![0u8; header.size as usize];
    conn.read_exact(&mut payload).await?;

    Ok(Frame {
        header,
        payload: payload.into(),
    })
}

/// Write one frame to the stream
///
/// The header and payload are sent as a single buffer. Callers that
/// share the stream between tasks must serialize calls so frames are
/// not interleaved.
pub async fn write_frame<T: AsyncWrite + Unpin>(
    conn: &mut T,
    frame: &Frame,
) -> Result<(), ProxyError> {
    conn.write_all(&frame.encode()).await?;
    conn.flush().await?;
    Ok(())
}
