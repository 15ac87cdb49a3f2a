//! # elproxy - EchoLink Proxy Server
//!
//! elproxy is a long-running network service that relays EchoLink
//! amateur-radio client traffic between authenticated remote clients
//! and the public EchoLink peer network. Each authorized client is
//! assigned a proxy slot whose external address is exposed to EchoLink
//! peers on the client's behalf, multiplexing a single TCP control
//! channel with the downstream EchoLink TCP and UDP flows.
//!
//! ## Features
//!
//! - **Challenge/Response Authentication**: MD5 digest over a shared
//!   password salted with a random nonce
//! - **Callsign Access Control**: optional allow/deny regular
//!   expressions over client callsigns
//! - **Multiple Slots**: one slot per configured external interface,
//!   each serving one client at a time
//! - **Directory Registration**: optional periodic announcement to the
//!   EchoLink proxy directory
//!
//! ## Usage
//!
//! ```rust,ignore
//! use elproxy::config::load_config;
//! use elproxy::proxy::Proxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("elproxy.toml")?;
//!
//!     let mut proxy = Proxy::new(config)?;
//!     proxy.open().await?;
//!     proxy.start().await?;
//!
//!     while proxy.process().await.is_ok() {}
//!
//!     proxy.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The acceptor hands each incoming client connection to the first idle
//! slot. The slot's worker authorizes the client (nonce challenge,
//! password digest, callsign check) and then relays framed messages
//! between the client and dynamically opened EchoLink peer sockets
//! until either side disconnects.
//!
//! ```text
//! EchoLink Client -> elproxy slot -> EchoLink peer (TCP 5200, UDP 5199/5198)
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registration;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::ProxyError;
pub use proxy::Proxy;

/// Version of the elproxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
