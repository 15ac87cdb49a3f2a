//! Digest helpers for client authentication
//!
//! The EchoLink proxy protocol authenticates clients with an MD5
//! challenge/response salted by a random nonce.

use md5::{Digest as Md5Digest, Md5};

/// Number of bytes in an MD5 digest
pub const DIGEST_LEN: usize = 16;

/// Number of hex characters in a rendered nonce
pub const NONCE_LEN: usize = 8;

/// Compute the MD5 digest of `data`
pub fn md5(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render a 32-bit nonce as eight lowercase hex characters
///
/// The nonce is rendered in network byte order, most significant byte
/// first.
pub fn nonce_to_hex(nonce: u32) -> [u8; NONCE_LEN] {
    let mut out = [0u8; NONCE_LEN];
    let rendered = hex::encode(nonce.to_be_bytes());
    out.copy_from_slice(rendered.as_bytes());
    out
}

/// Compute the password response expected from a client
///
/// The configured password has its ASCII lowercase letters folded to
/// uppercase (all other bytes pass through unchanged), the eight hex
/// characters of the nonce are appended, and the result is hashed with
/// MD5.
pub fn password_response(password: &str, nonce: u32) -> [u8; DIGEST_LEN] {
    let mut buf = Vec::with_capacity(password.len() + NONCE_LEN);

    for &b in password.as_bytes() {
        buf.push(if b.is_ascii_lowercase() { b - 32 } else { b });
    }

    buf.extend_from_slice(&nonce_to_hex(nonce));

    md5(&buf)
}
