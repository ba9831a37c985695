//! ZooKeeper backend built on the blocking `zookeeper` client
//!
//! Client calls run on tokio's blocking pool. Session state changes and
//! watch deliveries arrive on the client's own threads and are forwarded
//! into the session's event channel.

use super::{
    Connector, CoordinationStore, CreateMode, EventReceiver, SessionState, StoreError,
    StoreEvent, StoreResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zookeeper::{
    Acl, CreateMode as ZkCreateMode, WatchedEvent, WatchedEventType, ZkError, ZkResult, ZkState,
    ZooKeeper,
};

type EventSender = mpsc::UnboundedSender<StoreEvent>;

impl From<ZkError> for StoreError {
    fn from(err: ZkError) -> Self {
        match err {
            ZkError::NodeExists => StoreError::NodeExists,
            ZkError::NoNode => StoreError::NoNode,
            ZkError::NotEmpty => StoreError::NotEmpty,
            ZkError::ConnectionLoss | ZkError::OperationTimeout => StoreError::ConnectionLoss,
            ZkError::SessionExpired => StoreError::SessionExpired,
            ZkError::AuthFailed | ZkError::NoAuth => StoreError::AuthFailed,
            other => StoreError::Backend(format!("{:?}", other)),
        }
    }
}

impl From<CreateMode> for ZkCreateMode {
    fn from(mode: CreateMode) -> Self {
        match mode {
            CreateMode::Persistent => ZkCreateMode::Persistent,
            CreateMode::Ephemeral => ZkCreateMode::Ephemeral,
            CreateMode::EphemeralSequential => ZkCreateMode::EphemeralSequential,
        }
    }
}

fn session_states(state: ZkState) -> &'static [SessionState] {
    match state {
        ZkState::Connecting | ZkState::Associating | ZkState::NotConnected => {
            &[SessionState::Disconnected]
        }
        ZkState::Connected | ZkState::ConnectedReadOnly => {
            &[SessionState::Connected, SessionState::HasSession]
        }
        ZkState::AuthFailed => &[SessionState::AuthFailed],
        ZkState::Closed => &[SessionState::Closed],
    }
}

fn forward(tx: &EventSender, event: WatchedEvent) {
    let path = match event.path {
        Some(path) => path,
        None => return,
    };
    let event = match event.event_type {
        WatchedEventType::NodeChildrenChanged => StoreEvent::NodeChildrenChanged { path },
        WatchedEventType::NodeCreated => StoreEvent::NodeCreated { path },
        WatchedEventType::NodeDeleted => StoreEvent::NodeDeleted { path },
        WatchedEventType::NodeDataChanged => StoreEvent::NodeDataChanged { path },
        WatchedEventType::ChildWatchRemoved | WatchedEventType::DataWatchRemoved => {
            StoreEvent::NotWatching { path }
        }
        WatchedEventType::None => return,
    };
    let _ = tx.send(event);
}

/// Opens sessions against a ZooKeeper ensemble
#[derive(Clone, Copy, Debug, Default)]
pub struct ZooKeeperConnector;

#[async_trait]
impl Connector for ZooKeeperConnector {
    async fn connect(
        &self,
        servers: &[String],
        session_timeout: Duration,
    ) -> StoreResult<(Arc<dyn CoordinationStore>, EventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connect_string = servers.join(",");

        let watcher_tx = tx.clone();
        let zk = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&connect_string, session_timeout, move |event: WatchedEvent| {
                forward(&watcher_tx, event)
            })
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))??;

        let listener_tx = tx.clone();
        let _ = zk.add_listener(move |state: ZkState| {
            debug!("ZooKeeper state changed to {:?}", state);
            for session_state in session_states(state) {
                let _ = listener_tx.send(StoreEvent::Session(*session_state));
            }
        });

        let store: Arc<dyn CoordinationStore> = Arc::new(ZooKeeperStore {
            zk: Arc::new(zk),
            events: tx,
        });
        Ok((store, rx))
    }
}

pub struct ZooKeeperStore {
    zk: Arc<ZooKeeper>,
    events: EventSender,
}

impl ZooKeeperStore {
    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&ZooKeeper) -> ZkResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let zk = self.zk.clone();
        tokio::task::spawn_blocking(move || op(&zk))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperStore {
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> StoreResult<()> {
        let scheme = scheme.to_string();
        let auth = auth.to_vec();
        self.blocking(move |zk| zk.add_auth(scheme, auth)).await
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let path = path.to_string();
        self.blocking(move |zk| zk.exists(&path, false))
            .await
            .map(|stat| stat.is_some())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let path = path.to_string();
        let data = data.to_vec();
        self.blocking(move |zk| zk.create(&path, data, Acl::open_unsafe().clone(), mode.into()))
            .await
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let path = path.to_string();
        self.blocking(move |zk| zk.get_data(&path, false))
            .await
            .map(|(data, _)| data)
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let path = path.to_string();
        self.blocking(move |zk| zk.get_children(&path, false)).await
    }

    async fn children_watch(&self, path: &str) -> StoreResult<Vec<String>> {
        let path = path.to_string();
        let tx = self.events.clone();
        self.blocking(move |zk| {
            zk.get_children_w(&path, move |event: WatchedEvent| forward(&tx, event))
        })
        .await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let path = path.to_string();
        self.blocking(move |zk| zk.delete(&path, None)).await
    }

    async fn close(&self) {
        if let Err(e) = self.blocking(|zk| zk.close()).await {
            warn!("Failed to close ZooKeeper connection: {}", e);
        }
    }
}
