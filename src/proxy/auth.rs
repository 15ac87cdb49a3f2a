//! Client authorization handshake
//!
//! Before any frames are exchanged, a connecting client must prove
//! knowledge of the shared password and present a callsign this proxy
//! admits.
//!
//! # Protocol
//!
//! ```text
//! proxy  -> client   8 lowercase hex chars (nonce)
//! client -> proxy    CALLSIGN '\n' MD5[16]
//! ```
//!
//! The response digest is MD5 of the uppercase-folded password followed
//! by the eight nonce characters.

use super::acl::CallsignAcl;
use crate::error::ProxyError;
use crate::protocol::{
    nonce_to_hex, password_response, write_frame, Frame, SystemMsg, DIGEST_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest callsign the handshake accepts
pub const MAX_CALLSIGN_LEN: usize = 10;

/// Authorize an incoming client
///
/// Sends the nonce challenge, reads the callsign and digest response,
/// and verifies both the password digest and the callsign ACL. Returns
/// the callsign on success.
///
/// On a bad password or a denied callsign the matching SYSTEM frame is
/// sent before the error is returned; the caller closes the connection.
pub async fn authorize<S>(
    stream: &mut S,
    password: &str,
    acl: &CallsignAcl,
) -> Result<String, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: u32 = rand::random();

    // Generate the expected response before touching the socket
    let expected = password_response(password, nonce);

    stream.write_all(&nonce_to_hex(nonce)).await?;
    stream.flush().await?;

    // The reply is a newline-terminated callsign followed by a 16-byte
    // digest. Since the callsign is variable-length, initially read only
    // 16 bytes; the callsign is part of that, and the newline position
    // tells us how much is still missing.
    let mut buf = [0u8; DIGEST_LEN];
    stream.read_exact(&mut buf).await?;

    let idx = buf[..MAX_CALLSIGN_LEN + 1]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| {
            ProxyError::Protocol("malformed authorization: callsign terminator missing".to_string())
        })?;

    let callsign = std::str::from_utf8(&buf[..idx])
        .map_err(|_| {
            ProxyError::Protocol("malformed authorization: callsign is not ASCII".to_string())
        })?
        .to_string();

    let mut rest = vec![0u8; idx + 1];
    stream.read_exact(&mut rest).await?;

    let mut response = [0u8; DIGEST_LEN];
    response[..DIGEST_LEN - (idx + 1)].copy_from_slice(&buf[idx + 1..]);
    response[DIGEST_LEN - (idx + 1)..].copy_from_slice(&rest);

    if response != expected {
        write_frame(stream, &Frame::system(SystemMsg::BadPassword)).await?;
        return Err(ProxyError::BadPassword(callsign));
    }

    if !acl.allow(&callsign) {
        write_frame(stream, &Frame::system(SystemMsg::AccessDenied)).await?;
        return Err(ProxyError::AccessDenied(callsign));
    }

    Ok(callsign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::md5;
    use tokio::io::AsyncWriteExt;

    async fn drive_client(
        mut stream: tokio::io::DuplexStream,
        callsign: &str,
        password: &str,
    ) -> tokio::io::DuplexStream {
        let mut nonce_hex = [0u8; 8];
        stream.read_exact(&mut nonce_hex).await.unwrap();

        let mut material = password.to_uppercase().into_bytes();
        material.extend_from_slice(&nonce_hex);

        let mut reply = callsign.as_bytes().to_vec();
        reply.push(b'\n');
        reply.extend_from_slice(&md5(&material));
        stream.write_all(&reply).await.unwrap();

        stream
    }

    #[tokio::test]
    async fn test_authorize_success() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        let client_task = tokio::spawn(drive_client(client, "W1AW", "secret"));

        let callsign = authorize(&mut server, "secret", &acl).await.unwrap();
        assert_eq!(callsign, "W1AW");

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_password_case_insensitive() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        let client_task = tokio::spawn(drive_client(client, "W1AW", "SeCrEt"));

        let callsign = authorize(&mut server, "sEcReT", &acl).await.unwrap();
        assert_eq!(callsign, "W1AW");

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_wrong_password() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        let client_task = tokio::spawn(drive_client(client, "W1AW", "wrong"));

        let result = authorize(&mut server, "secret", &acl).await;
        assert!(matches!(result, Err(ProxyError::BadPassword(c)) if c == "W1AW"));

        // The client should observe the fixed bad-password SYSTEM frame
        let mut client = client_task.await.unwrap();
        let mut frame = [0u8; 10];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0x07, 0, 0, 0, 0, 0x01, 0, 0, 0, 0x01]);
    }

    #[tokio::test]
    async fn test_authorize_denied_callsign() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(Some("^[A-Z0-9]+$"), Some("^BAD1$")).unwrap();

        let client_task = tokio::spawn(drive_client(client, "BAD1", "secret"));

        let result = authorize(&mut server, "secret", &acl).await;
        assert!(matches!(result, Err(ProxyError::AccessDenied(c)) if c == "BAD1"));

        // The client should observe the fixed access-denied SYSTEM frame
        let mut client = client_task.await.unwrap();
        let mut frame = [0u8; 10];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0x07, 0, 0, 0, 0, 0x01, 0, 0, 0, 0x02]);
    }

    #[tokio::test]
    async fn test_authorize_missing_newline() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        let server_task =
            tokio::spawn(
                async move { authorize(&mut server, "secret", &acl).await },
            );

        let mut nonce_hex = [0u8; 8];
        client.read_exact(&mut nonce_hex).await.unwrap();

        // Eleven callsign bytes with no terminator
        client.write_all(b"TOOLONGCALL12345").await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_authorize_client_disconnect_is_transport_lost() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        drop(client);

        let result = authorize(&mut server, "secret", &acl).await;
        assert!(result.unwrap_err().is_transport_lost());
    }

    #[tokio::test]
    async fn test_authorize_ten_char_callsign() {
        let (client, mut server) = tokio::io::duplex(256);
        let acl = CallsignAcl::new(None, None).unwrap();

        let client_task = tokio::spawn(drive_client(client, "AB0CDE/MM9", "pw"));

        let callsign = authorize(&mut server, "pw", &acl).await.unwrap();
        assert_eq!(callsign, "AB0CDE/MM9");

        client_task.await.unwrap();
    }
}
