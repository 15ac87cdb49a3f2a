//! Error types for the EchoLink proxy
//!
//! This module defines the error type used throughout the library and
//! the classification of transport losses that only end a session.

use std::io;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client supplied an incorrect password
    #[error("Incorrect password from client '{0}'")]
    BadPassword(String),

    /// The client's callsign is not authorized to use this proxy
    #[error("Callsign '{0}' is not authorized")]
    AccessDenied(String),

    /// Registration error
    #[error("Registration error: {0}")]
    Registration(String),
}

impl ProxyError {
    /// Whether this error is a lost transport rather than a misbehaving
    /// peer
    ///
    /// Transport losses end the affected session and are logged at WARN;
    /// everything else is treated as a protocol or policy failure.
    pub fn is_transport_lost(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_transport_lost(e),
            _ => false,
        }
    }
}

/// Classify an IO error as a lost transport
///
/// Covers the connection-reset family a peer disappearing produces, plus
/// the interrupted reads a concurrent shutdown causes.
pub fn is_transport_lost(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
