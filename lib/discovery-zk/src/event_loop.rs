//! Single consumer of the session's event stream
//!
//! Session events drive registration recovery; children-changed events
//! invalidate the affected service. A session the store closes for good is
//! replaced through the client's connector. The loop never resolves
//! addresses itself.

use crate::client::Inner;
use crate::store::{EventReceiver, SessionState, StoreEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionAction {
    None,
    RestoreRegistration,
}

/// Tracks whether the connection is down between Disconnected and Connected.
#[derive(Debug, Default)]
pub(crate) struct SessionTracker {
    disconnected: bool,
}

impl SessionTracker {
    pub(crate) fn on_session(&mut self, state: SessionState) -> SessionAction {
        match state {
            SessionState::Disconnected => {
                self.disconnected = true;
                SessionAction::None
            }
            SessionState::Connected => {
                self.disconnected = false;
                SessionAction::None
            }
            SessionState::HasSession if !self.disconnected => SessionAction::RestoreRegistration,
            _ => SessionAction::None,
        }
    }
}

/// Service name for a children-changed path directly under `root`.
pub(crate) fn service_from_path<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

pub(crate) async fn watch(inner: Arc<Inner>, mut events: EventReceiver, cancel: CancellationToken) {
    let mut tracker = SessionTracker::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("zk watch loop cancelled");
                return;
            }
            event = events.recv() => event,
        };

        let event = match event {
            Some(StoreEvent::Session(SessionState::Closed)) | None => {
                if cancel.is_cancelled() {
                    info!("zk session closed");
                    return;
                }
                warn!("zk session closed by the store, reconnecting");
                match inner.reconnect(&cancel).await {
                    Some(fresh) => {
                        events = fresh;
                        tracker = SessionTracker::default();
                        continue;
                    }
                    None => return,
                }
            }
            Some(event) => event,
        };

        debug!("zk event received: {:?}", event);
        match event {
            StoreEvent::Session(state) => {
                if tracker.on_session(state) == SessionAction::RestoreRegistration {
                    inner.restore_registration().await;
                }
            }
            StoreEvent::NodeChildrenChanged { path } => {
                match service_from_path(inner.session.root(), &path) {
                    Some(service_name) => {
                        inner.state.lock().await.invalidate(service_name);
                        debug!("zk event handled for {}", path);
                    }
                    None => debug!("Ignoring children change outside services: {}", path),
                }
            }
            other => debug!("zk node event: {:?}", other),
        }
    }
}
