//! Client configuration

use crate::store::join_path;
use discovery_core::{BalancingPolicy, DialOptions, DiscoveryError, Result};
use std::fmt;
use std::time::Duration;
use tracing::Dispatch;

/// Period of the refresh backstop
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait after deleting our node before `unregister` returns
pub const DEFAULT_UNREGISTER_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_ROOT_PREFIX: &str = "/";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// `username:password`, as sent with the `digest` scheme
    pub fn digest(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Validated client configuration. Build with [`ZkConfig::builder`].
#[derive(Clone, Debug)]
pub struct ZkConfig {
    pub servers: Vec<String>,
    pub scheme: String,
    pub root_prefix: String,
    pub credentials: Option<Credentials>,
    pub refresh_interval: Duration,
    pub session_timeout: Duration,
    pub balancer: BalancingPolicy,
    pub dial_options: DialOptions,
    pub unregister_grace: Duration,
    /// Subscriber for the client's background tasks. Falls back to the
    /// global default, which discards everything unless one is installed.
    pub dispatch: Option<Dispatch>,
}

impl ZkConfig {
    pub fn builder(servers: Vec<String>, scheme: impl Into<String>) -> ZkConfigBuilder {
        ZkConfigBuilder::new(servers, scheme)
    }

    /// `<root_prefix>/<scheme>`
    pub fn root_path(&self) -> String {
        join_path(&self.root_prefix, &self.scheme)
    }
}

pub struct ZkConfigBuilder {
    servers: Vec<String>,
    scheme: String,
    root_prefix: String,
    credentials: Option<(String, String)>,
    refresh_interval: Duration,
    session_timeout: Duration,
    balancer: BalancingPolicy,
    dial_options: DialOptions,
    unregister_grace: Duration,
    dispatch: Option<Dispatch>,
}

impl ZkConfigBuilder {
    pub fn new(servers: Vec<String>, scheme: impl Into<String>) -> Self {
        Self {
            servers,
            scheme: scheme.into(),
            root_prefix: DEFAULT_ROOT_PREFIX.to_string(),
            credentials: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            balancer: BalancingPolicy::default(),
            dial_options: DialOptions::default(),
            unregister_grace: DEFAULT_UNREGISTER_GRACE,
            dispatch: None,
        }
    }

    pub fn root_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.root_prefix = prefix.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn balancer(mut self, policy: BalancingPolicy) -> Self {
        self.balancer = policy;
        self
    }

    pub fn dial_options(mut self, options: DialOptions) -> Self {
        self.dial_options = options;
        self
    }

    pub fn unregister_grace(mut self, grace: Duration) -> Self {
        self.unregister_grace = grace;
        self
    }

    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn build(self) -> Result<ZkConfig> {
        let invalid = |msg: &str| Err(DiscoveryError::Config(msg.to_string()));

        if self.servers.is_empty() || self.servers.iter().any(|s| s.trim().is_empty()) {
            return invalid("at least one non-empty server address is required");
        }
        if self.scheme.is_empty() || self.scheme.contains('/') || self.scheme.contains(':') {
            return invalid("scheme must be a non-empty name without '/' or ':'");
        }
        if !self.root_prefix.starts_with('/') {
            return invalid("root prefix must be an absolute path");
        }
        if self.refresh_interval.is_zero() {
            return invalid("refresh interval must be positive");
        }
        if self.session_timeout.is_zero() {
            return invalid("session timeout must be positive");
        }

        let credentials = match self.credentials {
            Some((username, password)) => {
                if username.is_empty() || password.is_empty() {
                    return invalid("credentials require both a username and a password");
                }
                Some(Credentials { username, password })
            }
            None => None,
        };

        Ok(ZkConfig {
            servers: self.servers,
            scheme: self.scheme,
            root_prefix: self.root_prefix,
            credentials,
            refresh_interval: self.refresh_interval,
            session_timeout: self.session_timeout,
            balancer: self.balancer,
            dial_options: self.dial_options,
            unregister_grace: self.unregister_grace,
            dispatch: self.dispatch,
        })
    }
}
