//! Service addresses and logical targets

use crate::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A live instance of a service, as read from the coordination store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// `host:port` the instance advertised
    pub addr: String,
    pub service_name: String,
}

impl Address {
    pub fn new(addr: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service_name: service_name.into(),
        }
    }
}

/// Combine a host and port into `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Logical `scheme:///service` target resolved through the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub service_name: String,
}

impl Target {
    pub fn new(scheme: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            service_name: service_name.into(),
        }
    }

    /// Parse `scheme:///service` or `scheme://service`.
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |reason: &str| DiscoveryError::InvalidTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme separator"))?;
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let service_name = rest.trim_start_matches('/');
        if service_name.is_empty() {
            return Err(invalid("empty service name"));
        }
        if service_name.contains('/') {
            return Err(invalid("service name must be a single path segment"));
        }

        Ok(Self::new(scheme, service_name))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.service_name)
    }
}
