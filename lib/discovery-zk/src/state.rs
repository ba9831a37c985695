//! State shared between callers, the event loop and the refresh task
//!
//! Everything here lives behind one mutex in the client. Nothing in this
//! module touches the network.

use crate::resolver::ResolverHandle;
use discovery_core::DialOptions;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Channel;
use tracing::debug;

/// This process's registration. Present exactly while registered, so a
/// node path never outlives the registered flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub service_name: String,
    /// Advertised `host:port`
    pub addr: String,
    /// Ephemeral node currently holding the registration
    pub node_path: String,
}

#[derive(Default)]
pub(crate) struct SharedState {
    pub(crate) registration: Option<Registration>,
    pub(crate) local_conns: HashMap<String, Vec<Channel>>,
    /// Bumped on every invalidation so in-flight lookups can tell their
    /// result went stale before it was cached.
    generations: HashMap<String, u64>,
    pub(crate) resolvers: HashMap<String, Vec<Arc<ResolverHandle>>>,
    pub(crate) options: DialOptions,
}

impl SharedState {
    pub(crate) fn new(options: DialOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub(crate) fn generation(&mut self, service_name: &str) -> u64 {
        *self
            .generations
            .entry(service_name.to_string())
            .or_default()
    }

    /// Drop the cached connections for one service and ask its resolvers to
    /// resolve again.
    pub(crate) fn invalidate(&mut self, service_name: &str) {
        debug!("Flushing resolver and local conns for {}", service_name);
        *self
            .generations
            .entry(service_name.to_string())
            .or_default() += 1;
        self.local_conns.remove(service_name);
        if let Some(handles) = self.resolvers.get(service_name) {
            for handle in handles {
                handle.resolve_now();
            }
        }
    }

    /// Invalidate every known service.
    pub(crate) fn invalidate_all(&mut self) {
        for handles in self.resolvers.values() {
            for handle in handles {
                handle.resolve_now();
            }
        }
        self.local_conns.clear();
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
    }

    /// Forget all cached connections and resolvers, returning the resolvers
    /// so the caller can close them.
    pub(crate) fn reset(&mut self) -> Vec<Arc<ResolverHandle>> {
        self.local_conns.clear();
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
        self.resolvers.drain().flat_map(|(_, handles)| handles).collect()
    }

    pub(crate) fn remove_resolver(&mut self, service_name: &str, id: u64) {
        if let Some(handles) = self.resolvers.get_mut(service_name) {
            handles.retain(|h| h.id() != id);
            if handles.is_empty() {
                self.resolvers.remove(service_name);
            }
        }
    }
}
