use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Boxed source error from a coordination-store backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to connect to coordination store {servers:?}: {source}")]
    Connect {
        servers: Vec<String>,
        #[source]
        source: BoxError,
    },

    #[error("Authentication failed for user {username}: {source}")]
    Auth {
        username: String,
        #[source]
        source: BoxError,
    },

    #[error("Node operation {op} failed on {path}: {source}")]
    Node {
        op: &'static str,
        path: String,
        #[source]
        source: BoxError,
    },

    #[error("No instance for service {service} (cached: {cached:?}, servers: {servers:?}, root: {root})")]
    NoInstance {
        service: String,
        cached: Vec<String>,
        servers: Vec<String>,
        root: String,
    },

    #[error("Dial failed for {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("Invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Not registered")]
    NotRegistered,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Client closed")]
    Closed,
}

impl DiscoveryError {
    pub fn node<E>(op: &'static str, path: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DiscoveryError::Node {
            op,
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// True when the lookup worked but the service has no live instances.
    pub fn is_no_instance(&self) -> bool {
        matches!(self, DiscoveryError::NoInstance { .. })
    }
}
