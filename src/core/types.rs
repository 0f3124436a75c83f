//! Shared value types for the host portal
//!
//! Status codes reported to completion sinks and the parsed form of the
//! endpoint keys used to route operations to their pools.

use crate::core::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Outcome of an operation phase, and the terminal status handed to a
/// completion sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpStatus {
    /// Phase completed successfully
    Ok,
    /// Socket died mid-operation; the connection is discarded and the
    /// operation may be retried elsewhere
    RetryDeadSocket,
    /// Operation exceeded its deadline
    Timeout,
    /// Generic internal error
    Generic,
    /// Connection was lost
    DeadConnection,
    /// Endpoint host name cannot be resolved
    InvalidHost,
    /// Endpoint refused or never answered connection attempts
    CantConnect,
    /// Application-level error code reported by the remote side
    Remote(i32),
}

impl OpStatus {
    /// True for [`OpStatus::Ok`]
    pub fn is_ok(&self) -> bool {
        matches!(self, OpStatus::Ok)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStatus::Ok => f.write_str("ok"),
            OpStatus::RetryDeadSocket => f.write_str("dead socket"),
            OpStatus::Timeout => f.write_str("timeout"),
            OpStatus::Generic => f.write_str("generic error"),
            OpStatus::DeadConnection => f.write_str("dead connection"),
            OpStatus::InvalidHost => f.write_str("invalid host"),
            OpStatus::CantConnect => f.write_str("cannot connect"),
            OpStatus::Remote(code) => write!(f, "remote error {}", code),
        }
    }
}

/// Canonical endpoint key: `host:port[:transport[:extra...]]`.
///
/// The full string is the identity of an endpoint pool; host and port are
/// split out once at parse time for connecting.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    key: Arc<str>,
    host_len: usize,
    port: u16,
}

impl EndpointKey {
    /// Parse an endpoint key
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, ':');
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::invalid_endpoint(key));
        }
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| Error::invalid_endpoint(key))?;

        Ok(Self {
            key: Arc::from(key),
            host_len: host.len(),
            port,
        })
    }

    /// Full key string
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Host name portion
    pub fn host(&self) -> &str {
        &self.key[..self.host_len]
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transport tag (third field), if present
    pub fn transport(&self) -> Option<&str> {
        self.key.splitn(4, ':').nth(2).filter(|t| !t.is_empty())
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointKey({})", self.key)
    }
}
