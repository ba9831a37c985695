//! Coordination store abstraction
//!
//! A `Connector` opens a session against a ZooKeeper-style store and hands
//! back a `CoordinationStore` plus the session's raw event stream. Watches
//! armed through `children_watch` are one-shot and are delivered on that
//! stream, alongside session state changes.

pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub use memory::{Fault, MemoryStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Receiving half of a session's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

/// Marker prepended to protected node names
pub const PROTECTED_PREFIX: &str = "_c_";

const PROTECTED_CREATE_ATTEMPTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node already exists")]
    NodeExists,

    #[error("node does not exist")]
    NoNode,

    #[error("node has children")]
    NotEmpty,

    #[error("connection lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("connection closed")]
    Closed,

    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// A session is established (fresh or re-validated) on the current connection
    HasSession,
    Expired,
    AuthFailed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Session(SessionState),
    NodeChildrenChanged { path: String },
    NodeCreated { path: String },
    NodeDeleted { path: String },
    NodeDataChanged { path: String },
    NotWatching { path: String },
}

/// Operations on an open store session. Every call may block on network I/O.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Create a node and return its actual path (which carries the sequence
    /// suffix for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String>;

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>>;

    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Read children and arm a one-shot children-changed watch on `path`.
    async fn children_watch(&self, path: &str) -> StoreResult<Vec<String>>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn close(&self);
}

/// Opens store sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        servers: &[String],
        session_timeout: Duration,
    ) -> StoreResult<(Arc<dyn CoordinationStore>, EventReceiver)>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Split `path` into its parent and final segment.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}

/// Create an ephemeral sequential node that can be recognized after a lost
/// response.
///
/// The node name is prefixed with `_c_<guid>-`. When the create fails with
/// `ConnectionLoss` the request may still have been applied, so the parent is
/// searched for a child carrying our prefix before retrying.
pub async fn create_protected_ephemeral_sequential(
    store: &dyn CoordinationStore,
    path: &str,
    data: &[u8],
) -> StoreResult<String> {
    let (parent, name) =
        split_path(path).ok_or_else(|| StoreError::Backend(format!("invalid path {}", path)))?;
    let prefix = format!("{}{}-", PROTECTED_PREFIX, Uuid::new_v4().simple());
    let protected_path = join_path(parent, &format!("{}{}", prefix, name));

    for attempt in 1..=PROTECTED_CREATE_ATTEMPTS {
        match store
            .create(&protected_path, data, CreateMode::EphemeralSequential)
            .await
        {
            Ok(created) => return Ok(created),
            Err(StoreError::ConnectionLoss) => {
                if let Ok(children) = store.children(parent).await {
                    if let Some(child) = children.iter().find(|c| c.starts_with(&prefix)) {
                        debug!("Reclaimed protected node {} after connection loss", child);
                        return Ok(join_path(parent, child));
                    }
                }
                debug!(
                    "Protected create of {} lost its connection (attempt {})",
                    protected_path, attempt
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::ConnectionLoss)
}
