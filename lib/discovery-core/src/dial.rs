//! Dial options for building tonic channels to discovered instances

use crate::{DiscoveryError, Result};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

/// Connect timeout used for eager dials when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options applied when dialing an instance.
///
/// Unset fields fall back to tonic's defaults. Options merge left to right:
/// fields set on the right-hand side win, so per-call options override the
/// client-wide ones added with `add_option`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
    /// Per-request timeout
    pub timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    pub http2_keep_alive_interval: Option<Duration>,
    pub concurrency_limit: Option<usize>,
    pub user_agent: Option<String>,
    /// Establish the connection before returning instead of on first use
    pub eager: Option<bool>,
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that connect before returning.
    pub fn eager() -> Self {
        Self {
            eager: Some(true),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tcp_keepalive(mut self, keepalive: Duration) -> Self {
        self.tcp_keepalive = Some(keepalive);
        self
    }

    pub fn with_http2_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.http2_keep_alive_interval = Some(interval);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&self, other: &DialOptions) -> DialOptions {
        DialOptions {
            connect_timeout: other.connect_timeout.or(self.connect_timeout),
            timeout: other.timeout.or(self.timeout),
            tcp_keepalive: other.tcp_keepalive.or(self.tcp_keepalive),
            http2_keep_alive_interval: other
                .http2_keep_alive_interval
                .or(self.http2_keep_alive_interval),
            concurrency_limit: other.concurrency_limit.or(self.concurrency_limit),
            user_agent: other.user_agent.clone().or_else(|| self.user_agent.clone()),
            eager: other.eager.or(self.eager),
        }
    }

    pub fn is_eager(&self) -> bool {
        self.eager.unwrap_or(false)
    }

    /// Build a tonic endpoint for `addr` (`host:port`).
    pub fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let invalid = |reason: String| DiscoveryError::InvalidTarget {
            target: addr.to_string(),
            reason,
        };

        let mut endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| invalid(e.to_string()))?;

        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        } else if self.is_eager() {
            endpoint = endpoint.connect_timeout(DEFAULT_CONNECT_TIMEOUT);
        }
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if self.tcp_keepalive.is_some() {
            endpoint = endpoint.tcp_keepalive(self.tcp_keepalive);
        }
        if let Some(interval) = self.http2_keep_alive_interval {
            endpoint = endpoint.http2_keep_alive_interval(interval);
        }
        if let Some(limit) = self.concurrency_limit {
            endpoint = endpoint.concurrency_limit(limit);
        }
        if let Some(user_agent) = &self.user_agent {
            endpoint = endpoint
                .user_agent(user_agent.clone())
                .map_err(|e| invalid(e.to_string()))?;
        }

        Ok(endpoint)
    }

    /// Dial `addr`, connecting up front only when the options are eager.
    pub async fn dial(&self, addr: &str) -> Result<Channel> {
        let endpoint = self.endpoint(addr)?;

        if self.is_eager() {
            match endpoint.connect().await {
                Ok(channel) => {
                    debug!("Connected to {}", addr);
                    Ok(channel)
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", addr, e);
                    Err(DiscoveryError::Dial {
                        addr: addr.to_string(),
                        source: e,
                    })
                }
            }
        } else {
            Ok(endpoint.connect_lazy())
        }
    }

    /// Check that `addr` can be dialed with these options, then drop the channel.
    pub async fn probe(&self, addr: &str) -> Result<()> {
        self.dial(addr).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_right_hand_side() {
        let base = DialOptions::new()
            .with_connect_timeout(Duration::from_secs(3))
            .with_user_agent("base");
        let call = DialOptions::new()
            .with_connect_timeout(Duration::from_secs(1))
            .with_concurrency_limit(8);

        let merged = base.merge(&call);
        assert_eq!(merged.connect_timeout, Some(Duration::from_secs(1)));
        assert_eq!(merged.concurrency_limit, Some(8));
        assert_eq!(merged.user_agent.as_deref(), Some("base"));
        assert!(!merged.is_eager());
    }

    #[test]
    fn test_endpoint_rejects_bad_address() {
        let err = DialOptions::new().endpoint("bad host:90").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));
    }

    #[tokio::test]
    async fn test_lazy_dial_does_not_connect() {
        // Nothing listens here; a lazy dial still succeeds.
        let channel = DialOptions::new().dial("127.0.0.1:1").await;
        assert!(channel.is_ok());
    }

    #[tokio::test]
    async fn test_eager_dial_reports_failure() {
        let options = DialOptions::eager().with_connect_timeout(Duration::from_millis(500));
        let err = options.probe("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Dial { ref addr, .. } if addr == "127.0.0.1:1"));
    }
}
