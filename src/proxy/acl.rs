//! Callsign access control
//!
//! Admission is decided by an optional allow pattern and an optional
//! deny pattern over the client's callsign.

use crate::error::ProxyError;
use regex::Regex;

/// Compiled callsign allow/deny patterns
#[derive(Debug, Default)]
pub struct CallsignAcl {
    /// Callsigns must match this to be admitted, when present
    allowed: Option<Regex>,

    /// Callsigns matching this are turned away, when present
    denied: Option<Regex>,
}

impl CallsignAcl {
    /// Compile the configured patterns
    ///
    /// An invalid pattern is a configuration error and prevents the
    /// proxy from starting.
    pub fn new(allowed: Option<&str>, denied: Option<&str>) -> Result<Self, ProxyError> {
        let allowed = allowed
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ProxyError::Config(format!("invalid allowed callsigns pattern: {e}"))
                })
            })
            .transpose()?;

        let denied = denied
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ProxyError::Config(format!("invalid denied callsigns pattern: {e}"))
                })
            })
            .transpose()?;

        Ok(CallsignAcl { allowed, denied })
    }

    /// Decide whether a callsign may use this proxy
    ///
    /// Admitted iff the deny pattern (when present) does not match and
    /// the allow pattern (when present) does match.
    pub fn allow(&self, callsign: &str) -> bool {
        if let Some(denied) = &self.denied {
            if denied.is_match(callsign) {
                return false;
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.is_match(callsign) {
                return false;
            }
        }

        true
    }
}
