//! Configuration module for the EchoLink proxy
//!
//! The proxy is configured from a TOML file whose keys follow the
//! conventions EchoLink proxy operators already know (`Password`,
//! `BindAddress`, `ExternalBindAddress`, ...).

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default listening port for an EchoLink proxy
fn default_port() -> u16 {
    8100
}

/// Proxy configuration
///
/// Read-only once the proxy has been opened.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Shared password clients must respond with
    ///
    /// Case-insensitive for the purposes of the challenge response. The
    /// well-known value `PUBLIC` marks an open proxy.
    #[serde(rename = "Password")]
    pub password: String,

    /// Interface the client listener binds to; all interfaces if unset
    #[serde(rename = "BindAddress", default)]
    pub bind_addr: Option<String>,

    /// TCP port the client listener binds to
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,

    /// External interface whose address is exposed to EchoLink peers for
    /// the first slot
    #[serde(rename = "ExternalBindAddress", default)]
    pub bind_addr_ext: Option<String>,

    /// Additional external interfaces; each defines one extra slot
    #[serde(rename = "AdditionalExternalBindAddresses", default)]
    pub bind_addr_ext_add: Vec<String>,

    /// Regular expression callsigns must match to be admitted
    #[serde(rename = "CallsignAllowList", default)]
    pub calls_allowed: Option<String>,

    /// Regular expression matching callsigns that are turned away
    #[serde(rename = "CallsignDenyList", default)]
    pub calls_denied: Option<String>,

    /// Name to register with the EchoLink proxy directory; registration
    /// is disabled when unset
    #[serde(rename = "RegistrationName", default)]
    pub reg_name: Option<String>,

    /// Comment shown alongside the directory registration
    #[serde(rename = "RegistrationComment", default)]
    pub reg_comment: Option<String>,

    /// Publicly reachable address announced to the directory
    #[serde(rename = "PublicAddress", default)]
    pub public_addr: Option<String>,
}

impl Config {
    /// Number of proxy slots this configuration defines
    pub fn num_clients(&self) -> usize {
        1 + self.bind_addr_ext_add.len()
    }

    /// Whether this proxy is open to the public
    pub fn is_public(&self) -> bool {
        self.password == "PUBLIC"
    }

    /// Validate the configuration
    ///
    /// Fails when the password is missing, or when additional external
    /// bind addresses are listed without a concrete
    /// `ExternalBindAddress` to pair the first slot with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.password.is_empty() || self.password == "notset" {
            return Err(ProxyError::Config("missing password".to_string()));
        }

        if !self.bind_addr_ext_add.is_empty() {
            match self.bind_addr_ext.as_deref() {
                None | Some("0.0.0.0") => {
                    return Err(ProxyError::Config(
                        "ExternalBindAddress must be specified if \
                         AdditionalExternalBindAddresses is used"
                            .to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Load and validate a configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ProxyError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        ProxyError::Config(format!(
            "failed to read config file {:?}: {e}",
            path.as_ref()
        ))
    })?;

    let config = parse_config(&content)?;
    config.validate()?;

    Ok(config)
}

/// Parse a configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config, ProxyError> {
    toml::from_str(content).map_err(|e| ProxyError::Config(format!("failed to parse: {e}")))
}
