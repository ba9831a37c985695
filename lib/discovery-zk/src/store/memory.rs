//! In-process coordination store
//!
//! `MemoryStore` plays the role of a whole ensemble: every `open_session`
//! (or `Connector::connect`) creates an independent session, so several
//! clients sharing one `MemoryStore` behave like separate processes talking
//! to the same cluster. Ephemeral nodes belong to the session that created
//! them and go away when it closes or expires.

use super::{
    split_path, Connector, CoordinationStore, CreateMode, EventReceiver, SessionState,
    StoreError, StoreEvent, StoreResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// A one-shot failure injected into a session's next operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next operation fails before it is applied
    ConnectionLoss,
    /// The next create is applied but its response is lost
    ConnectionLossAfterCreate,
}

#[derive(Clone)]
pub struct MemoryStore {
    ensemble: Arc<Mutex<Ensemble>>,
}

struct Ensemble {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, Slot>,
    next_session: u64,
    credentials: Option<Vec<u8>>,
    suppress_watches: bool,
}

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    next_seq: u64,
}

struct Slot {
    events: mpsc::UnboundedSender<StoreEvent>,
    child_watches: HashSet<String>,
    connected: bool,
    fault: Option<Fault>,
}

impl Slot {
    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn emit_session(&self, states: &[SessionState]) {
        for state in states {
            self.emit(StoreEvent::Session(*state));
        }
    }
}

impl Ensemble {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
                next_seq: 0,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 1,
            credentials: None,
            suppress_watches: false,
        }
    }

    fn check(&mut self, id: u64) -> StoreResult<()> {
        let slot = self.sessions.get_mut(&id).ok_or(StoreError::Closed)?;
        if !slot.connected {
            return Err(StoreError::ConnectionLoss);
        }
        if slot.fault == Some(Fault::ConnectionLoss) {
            slot.fault = None;
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }

    fn children_of(&self, path: &str) -> StoreResult<Vec<String>> {
        if !self.nodes.contains_key(path) {
            return Err(StoreError::NoNode);
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        Ok(self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn fire_child_watch(&mut self, parent: &str) {
        let suppress = self.suppress_watches;
        for slot in self.sessions.values_mut() {
            if slot.child_watches.remove(parent) {
                if suppress {
                    debug!("Dropping children watch delivery for {}", parent);
                } else {
                    slot.emit(StoreEvent::NodeChildrenChanged {
                        path: parent.to_string(),
                    });
                }
            }
        }
    }

    /// End a session: emit Closed, drop its event stream and remove its
    /// ephemeral nodes.
    fn close_session(&mut self, id: u64) {
        if let Some(slot) = self.sessions.remove(&id) {
            slot.emit(StoreEvent::Session(SessionState::Closed));
            self.remove_ephemerals(id);
            debug!("Closed memory session {}", id);
        }
    }

    fn remove_ephemerals(&mut self, owner: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(owner))
            .map(|(path, _)| path.clone())
            .collect();

        let mut parents = BTreeSet::new();
        for path in owned {
            self.nodes.remove(&path);
            if let Some((parent, _)) = split_path(&path) {
                parents.insert(parent.to_string());
            }
        }
        for parent in parents {
            self.fire_child_watch(&parent);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            ensemble: Arc::new(Mutex::new(Ensemble::new())),
        }
    }

    /// Open a new session. The stream starts with Connecting, Connected and
    /// HasSession.
    pub fn open_session(&self) -> (Arc<MemorySession>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ensemble = self.ensemble.lock();
        let id = ensemble.next_session;
        ensemble.next_session += 1;

        let slot = Slot {
            events: tx,
            child_watches: HashSet::new(),
            connected: true,
            fault: None,
        };
        slot.emit_session(&[
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::HasSession,
        ]);
        ensemble.sessions.insert(id, slot);
        debug!("Opened memory session {}", id);

        let session = MemorySession {
            id,
            ensemble: self.ensemble.clone(),
        };
        (Arc::new(session), rx)
    }

    /// Ids of open sessions, oldest first
    pub fn sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.ensemble.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Require `digest` authentication with `username:password`.
    pub fn require_auth(&self, username: &str, password: &str) {
        self.ensemble.lock().credentials = Some(format!("{}:{}", username, password).into_bytes());
    }

    /// Consume watches without delivering them.
    pub fn suppress_watches(&self, suppress: bool) {
        self.ensemble.lock().suppress_watches = suppress;
    }

    pub fn inject_fault(&self, session: u64, fault: Fault) {
        if let Some(slot) = self.ensemble.lock().sessions.get_mut(&session) {
            slot.fault = Some(fault);
        }
    }

    /// Drop the session's connection without ending the session.
    pub fn disconnect(&self, session: u64) {
        if let Some(slot) = self.ensemble.lock().sessions.get_mut(&session) {
            slot.connected = false;
            slot.emit(StoreEvent::Session(SessionState::Disconnected));
        }
    }

    /// Restore a connection dropped with `disconnect`.
    pub fn reconnect(&self, session: u64) {
        if let Some(slot) = self.ensemble.lock().sessions.get_mut(&session) {
            slot.connected = true;
            slot.emit_session(&[
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::HasSession,
            ]);
        }
    }

    /// Expire the session: its ephemeral nodes and watches are gone, then the
    /// client reconnects with a fresh session.
    pub fn expire_session(&self, session: u64) {
        let mut ensemble = self.ensemble.lock();
        match ensemble.sessions.get_mut(&session) {
            Some(slot) => {
                if slot.connected {
                    slot.emit(StoreEvent::Session(SessionState::Disconnected));
                }
                slot.child_watches.clear();
                slot.connected = false;
            }
            None => return,
        }

        ensemble.remove_ephemerals(session);
        debug!("Expired memory session {}", session);

        if let Some(slot) = ensemble.sessions.get_mut(&session) {
            slot.connected = true;
            slot.emit_session(&[
                SessionState::Expired,
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::HasSession,
            ]);
        }
    }

    /// Close the session from the store's side, the way a ZooKeeper client
    /// gives up after being partitioned past its session timeout. Unlike
    /// `expire_session` the session never comes back.
    pub fn terminate_session(&self, session: u64) {
        self.ensemble.lock().close_session(session);
    }

    /// Children of `path` as seen by an outside observer
    pub fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.ensemble.lock().children_of(path)
    }

    pub fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.ensemble
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or(StoreError::NoNode)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(
        &self,
        _servers: &[String],
        _session_timeout: Duration,
    ) -> StoreResult<(Arc<dyn CoordinationStore>, EventReceiver)> {
        let (session, events) = self.open_session();
        let session: Arc<dyn CoordinationStore> = session;
        Ok((session, events))
    }
}

/// One client session on a `MemoryStore`
pub struct MemorySession {
    id: u64,
    ensemble: Arc<Mutex<Ensemble>>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> StoreResult<()> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        match &ensemble.credentials {
            Some(expected) if scheme != "digest" || expected.as_slice() != auth => {
                Err(StoreError::AuthFailed)
            }
            _ => Ok(()),
        }
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        Ok(ensemble.nodes.contains_key(path))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;

        let (parent, _) = split_path(path)
            .ok_or_else(|| StoreError::Backend(format!("invalid path {}", path)))?;
        let actual = {
            let parent_node = ensemble.nodes.get_mut(parent).ok_or(StoreError::NoNode)?;
            if parent_node.owner.is_some() {
                return Err(StoreError::Backend(
                    "ephemeral nodes cannot have children".to_string(),
                ));
            }
            if mode.is_sequential() {
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                format!("{}{:010}", path, seq)
            } else {
                path.to_string()
            }
        };

        if ensemble.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists);
        }
        ensemble.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                owner: mode.is_ephemeral().then_some(self.id),
                next_seq: 0,
            },
        );
        ensemble.fire_child_watch(parent);

        if let Some(slot) = ensemble.sessions.get_mut(&self.id) {
            if slot.fault == Some(Fault::ConnectionLossAfterCreate) {
                slot.fault = None;
                return Err(StoreError::ConnectionLoss);
            }
        }
        Ok(actual)
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        ensemble
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or(StoreError::NoNode)
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        ensemble.children_of(path)
    }

    async fn children_watch(&self, path: &str) -> StoreResult<Vec<String>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        let children = ensemble.children_of(path)?;
        if let Some(slot) = ensemble.sessions.get_mut(&self.id) {
            slot.child_watches.insert(path.to_string());
        }
        Ok(children)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check(self.id)?;
        if !ensemble.nodes.contains_key(path) {
            return Err(StoreError::NoNode);
        }
        if !ensemble.children_of(path)?.is_empty() {
            return Err(StoreError::NotEmpty);
        }
        ensemble.nodes.remove(path);
        if let Some((parent, _)) = split_path(path) {
            ensemble.fire_child_watch(parent);
        }
        Ok(())
    }

    async fn close(&self) {
        self.ensemble.lock().close_session(self.id);
    }
}
