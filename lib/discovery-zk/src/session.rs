//! Coordination session: store handle, authentication and node layout

use crate::config::{Credentials, ZkConfig};
use crate::store::{
    create_protected_ephemeral_sequential, join_path, split_path, Connector, CoordinationStore,
    CreateMode, EventReceiver, StoreError,
};
use discovery_core::{DiscoveryError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct ClientSession {
    /// Swapped when a closed session is replaced by a new one
    store: RwLock<Arc<dyn CoordinationStore>>,
    connector: Arc<dyn Connector>,
    servers: Vec<String>,
    session_timeout: Duration,
    credentials: Option<Credentials>,
    root: String,
}

/// Open a store session and authenticate it. The store is closed again when
/// authentication fails.
async fn open(
    connector: &dyn Connector,
    servers: &[String],
    session_timeout: Duration,
    credentials: Option<&Credentials>,
) -> Result<(Arc<dyn CoordinationStore>, EventReceiver)> {
    let (store, events) = connector
        .connect(servers, session_timeout)
        .await
        .map_err(|e| DiscoveryError::Connect {
            servers: servers.to_vec(),
            source: Box::new(e),
        })?;

    if let Some(credentials) = credentials {
        if let Err(e) = store
            .add_auth("digest", credentials.digest().as_bytes())
            .await
        {
            store.close().await;
            return Err(DiscoveryError::Auth {
                username: credentials.username.clone(),
                source: Box::new(e),
            });
        }
    }
    Ok((store, events))
}

impl ClientSession {
    /// Open a session, authenticate and make sure the root node exists.
    /// The store is closed again when any step fails.
    pub(crate) async fn connect(
        config: &ZkConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, EventReceiver)> {
        let (store, events) = open(
            connector.as_ref(),
            &config.servers,
            config.session_timeout,
            config.credentials.as_ref(),
        )
        .await?;

        let session = Self {
            store: RwLock::new(store),
            connector,
            servers: config.servers.clone(),
            session_timeout: config.session_timeout,
            credentials: config.credentials.clone(),
            root: config.root_path(),
        };
        if let Err(e) = session.ensure_root().await {
            session.close().await;
            return Err(e);
        }

        info!("Connected to coordination store {:?}, root {}", session.servers, session.root);
        Ok((session, events))
    }

    /// Replace the current store with a freshly opened session and return
    /// the new session's event stream. The old store is closed.
    pub(crate) async fn reconnect(&self) -> Result<EventReceiver> {
        let (store, events) = open(
            self.connector.as_ref(),
            &self.servers,
            self.session_timeout,
            self.credentials.as_ref(),
        )
        .await?;

        let old = std::mem::replace(&mut *self.store.write(), store);
        old.close().await;
        if let Err(e) = self.ensure_root().await {
            warn!("Root check after reconnect failed: {}", e);
            return Err(e);
        }

        info!("Reconnected to coordination store {:?}", self.servers);
        Ok(events)
    }

    fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.read().clone()
    }

    pub(crate) fn root(&self) -> &str {
        &self.root
    }

    pub(crate) fn servers(&self) -> &[String] {
        &self.servers
    }

    pub(crate) fn service_path(&self, service_name: &str) -> String {
        join_path(&self.root, service_name)
    }

    /// Create the root path and any missing ancestors.
    pub(crate) async fn ensure_root(&self) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut path = self.root.as_str();
        while let Some((parent, _)) = split_path(path) {
            ancestors.push(path);
            path = parent;
        }
        for node in ancestors.into_iter().rev() {
            self.ensure_and_create(node).await?;
        }
        Ok(())
    }

    pub(crate) async fn ensure_service(&self, service_name: &str) -> Result<()> {
        self.ensure_and_create(&self.service_path(service_name)).await
    }

    async fn ensure_and_create(&self, path: &str) -> Result<()> {
        let exists = self
            .store()
            .exists(path)
            .await
            .map_err(|e| DiscoveryError::node("exists", path, e))?;
        if !exists {
            match self.store().create(path, b"", CreateMode::Persistent).await {
                Ok(_) | Err(StoreError::NodeExists) => debug!("Ensured node {}", path),
                Err(e) => return Err(DiscoveryError::node("create", path, e)),
            }
        }
        Ok(())
    }

    /// Create this process's ephemeral instance node under `service_name`.
    pub(crate) async fn create_temp_node(&self, service_name: &str, addr: &str) -> Result<String> {
        let path = format!("{}_", join_path(&self.service_path(service_name), addr));
        let store = self.store();
        match create_protected_ephemeral_sequential(store.as_ref(), &path, addr.as_bytes())
            .await
        {
            Ok(node) => Ok(node),
            Err(e) => Err(DiscoveryError::node(
                "create_protected_ephemeral_sequential",
                path,
                e,
            )),
        }
    }

    /// Delete a node; a node that is already gone counts as deleted.
    pub(crate) async fn delete_node(&self, path: &str) -> Result<()> {
        match self.store().delete(path).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode) => {
                debug!("Node {} already gone", path);
                Ok(())
            }
            Err(e) => Err(DiscoveryError::node("delete", path, e)),
        }
    }

    pub(crate) async fn exists(&self, path: &str) -> Result<bool> {
        self.store()
            .exists(path)
            .await
            .map_err(|e| DiscoveryError::node("exists", path, e))
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.store()
            .get(path)
            .await
            .map_err(|e| DiscoveryError::node("get", path, e))
    }

    pub(crate) async fn children_watch(&self, path: &str) -> Result<Vec<String>> {
        self.store()
            .children_watch(path)
            .await
            .map_err(|e| DiscoveryError::node("children_watch", path, e))
    }

    /// Replace the persistent node at `path` with `data`.
    pub(crate) async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.delete_node(path).await?;
        match self.store().create(path, data, CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            Err(e) => Err(DiscoveryError::node("create", path, e)),
        }
    }

    pub(crate) async fn close(&self) {
        self.store().close().await;
    }
}
