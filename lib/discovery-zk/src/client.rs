//! Registry client over a coordination store
//!
//! `ZkClient` registers this process as an instance of a service, resolves
//! other services from their subtrees and keeps a connection cache and any
//! live resolvers in step with membership changes. Two background tasks run
//! for the life of the client: the event loop and the refresh scheduler.

use crate::config::ZkConfig;
use crate::event_loop;
use crate::refresh;
use crate::resolver::{self, ResolverHandle};
use crate::session::ClientSession;
use crate::state::{Registration, SharedState};
use crate::store::{join_path, Connector, EventReceiver};
use async_trait::async_trait;
use discovery_core::{
    join_host_port, Address, BalanceSink, Conn, DialOptions, DiscoveryError, ResolverSink,
    Result, SvcDiscoveryRegistry, Target,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

/// Buffer between a resolver and its balance channel
const BALANCE_CHANNEL_CAPACITY: usize = 1024;

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(10);

pub struct ZkClient {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ZkConfig,
    pub(crate) session: ClientSession,
    pub(crate) state: Mutex<SharedState>,
    cancel: CancellationToken,
    next_resolver_id: AtomicU64,
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(DiscoveryError::InvalidTarget {
            target: name.to_string(),
            reason: format!("{} must be a non-empty single path segment", kind),
        });
    }
    Ok(())
}

impl Inner {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.config.dispatch {
            Some(dispatch) => {
                tokio::spawn(task.with_subscriber(dispatch.clone()));
            }
            None => {
                tokio::spawn(task);
            }
        }
    }

    /// Read the service's instances and re-arm the children watch.
    pub(crate) async fn resolve_remote(&self, service_name: &str) -> Result<Vec<Address>> {
        check_name("service name", service_name)?;
        self.session.ensure_service(service_name).await?;

        let path = self.session.service_path(service_name);
        let children = self.session.children_watch(&path).await?;

        let mut addrs = Vec::with_capacity(children.len());
        for child in children {
            let data = self.session.get(&join_path(&path, &child)).await?;
            let addr = String::from_utf8_lossy(&data).into_owned();
            debug!("Got addr {} for {} from remote", addr, service_name);
            addrs.push(Address::new(addr, service_name));
        }
        Ok(addrs)
    }

    /// Make sure the remembered registration still has a node after a new
    /// session was established.
    pub(crate) async fn restore_registration(&self) {
        let snapshot = match self.state.lock().await.registration.clone() {
            Some(registration) => registration,
            None => return,
        };

        match self.session.exists(&snapshot.node_path).await {
            Ok(true) => {
                debug!("Registration node {} survived reconnect", snapshot.node_path);
                return;
            }
            Ok(false) => {
                info!(
                    "Registration node {} is gone, recreating for {}",
                    snapshot.node_path, snapshot.service_name
                );
            }
            Err(e) => warn!("Could not check registration node: {}", e),
        }

        let node = match self.recreate_node(&snapshot).await {
            Ok(node) => node,
            Err(e) => {
                error!(
                    "Failed to recreate registration node for {}: {}",
                    snapshot.service_name, e
                );
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            if let Some(current) = state.registration.as_mut() {
                if *current == snapshot {
                    info!("Recreated registration node {}", node);
                    current.node_path = node;
                    return;
                }
            }
        }

        debug!("Registration changed during recovery, removing {}", node);
        if let Err(e) = self.session.delete_node(&node).await {
            warn!("Failed to remove stale node: {}", e);
        }
    }

    /// Replace a session the store closed for good, retrying with backoff
    /// until it succeeds or the client is closed. Returns the new session's
    /// event stream.
    pub(crate) async fn reconnect(&self, cancel: &CancellationToken) -> Option<EventReceiver> {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            match self.session.reconnect().await {
                Ok(events) => {
                    // Watches died with the old session.
                    self.state.lock().await.invalidate_all();
                    self.restore_registration().await;
                    return Some(events);
                }
                Err(e) => warn!("zk reconnect failed, retrying in {:?}: {}", backoff, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    }

    async fn recreate_node(&self, registration: &Registration) -> Result<String> {
        self.session.ensure_service(&registration.service_name).await?;
        self.session
            .create_temp_node(&registration.service_name, &registration.addr)
            .await
    }
}

impl ZkClient {
    /// Connect to a ZooKeeper ensemble.
    #[cfg(feature = "zookeeper")]
    pub async fn connect(config: ZkConfig) -> Result<Self> {
        Self::connect_with(config, &crate::store::zookeeper::ZooKeeperConnector).await
    }

    /// Connect through `connector`, then start the event loop and the
    /// refresh scheduler. The connector is kept to replace sessions the store
    /// closes for good.
    pub async fn connect_with<C>(config: ZkConfig, connector: &C) -> Result<Self>
    where
        C: Connector + Clone + 'static,
    {
        let connector: Arc<dyn Connector> = Arc::new(connector.clone());
        let (session, events) = ClientSession::connect(&config, connector).await?;
        let refresh_interval = config.refresh_interval;

        let inner = Arc::new(Inner {
            state: Mutex::new(SharedState::new(config.dial_options.clone())),
            config,
            session,
            cancel: CancellationToken::new(),
            next_resolver_id: AtomicU64::new(1),
        });

        inner.spawn(event_loop::watch(
            inner.clone(),
            events,
            inner.cancel.clone(),
        ));
        inner.spawn(refresh::refresh(
            inner.clone(),
            refresh_interval,
            inner.cancel.clone(),
        ));

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ZkConfig {
        &self.inner.config
    }

    /// `<root_prefix>/<scheme>`
    pub fn root_path(&self) -> &str {
        self.inner.session.root()
    }

    pub async fn registration(&self) -> Option<Registration> {
        self.inner.state.lock().await.registration.clone()
    }

    /// Path of the node currently holding our registration
    pub async fn node_path(&self) -> Option<String> {
        self.registration().await.map(|r| r.node_path)
    }

    /// Number of live resolvers across all services
    pub async fn resolver_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .resolvers
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Snapshot of the connection cache
    pub async fn local_conns(&self) -> HashMap<String, Vec<Channel>> {
        self.inner.state.lock().await.local_conns.clone()
    }

    /// Register this process as an instance of `service_name` at `host:port`.
    pub async fn register(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        opts: DialOptions,
    ) -> Result<()> {
        check_name("service name", service_name)?;
        self.inner.session.ensure_service(service_name).await?;

        let addr = join_host_port(host, port);
        opts.probe(&addr).await?;

        let node_path = self.inner.session.create_temp_node(service_name, &addr).await?;
        let registration = Registration {
            service_name: service_name.to_string(),
            addr,
            node_path,
        };
        info!(
            "Registered {} at {} ({})",
            registration.service_name, registration.addr, registration.node_path
        );

        let previous = self
            .inner
            .state
            .lock()
            .await
            .registration
            .replace(registration);
        if let Some(previous) = previous {
            debug!("Replacing previous registration {}", previous.node_path);
            if let Err(e) = self.inner.session.delete_node(&previous.node_path).await {
                warn!("Failed to remove previous registration node: {}", e);
            }
        }
        Ok(())
    }

    /// Remove our node and reset every cached connection and resolver.
    ///
    /// Resolvers are closed, so channels from `get_conn` keep their last
    /// address set and stop following membership. Call `get_conn` again for
    /// a tracking channel.
    pub async fn unregister(&self) -> Result<()> {
        let registration = self
            .inner
            .state
            .lock()
            .await
            .registration
            .take()
            .ok_or(DiscoveryError::NotRegistered)?;

        if let Err(e) = self.inner.session.delete_node(&registration.node_path).await {
            let mut state = self.inner.state.lock().await;
            if state.registration.is_none() {
                state.registration = Some(registration);
            }
            return Err(e);
        }

        let grace = self.inner.config.unregister_grace;
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        let handles = self.inner.state.lock().await.reset();
        for handle in handles {
            handle.close();
        }
        info!(
            "Unregistered {} at {}",
            registration.service_name, registration.addr
        );
        Ok(())
    }

    /// Current instances of `service_name`. An empty list means the service
    /// exists but has no live instances.
    pub async fn resolve_remote(&self, service_name: &str) -> Result<Vec<Address>> {
        self.inner.resolve_remote(service_name).await
    }

    /// Dialed connections to every instance, cached until the service's
    /// membership changes or the next refresh.
    pub async fn get_conns(&self, service_name: &str, opts: DialOptions) -> Result<Vec<Channel>> {
        debug!("Get conns for {}", service_name);
        let (generation, options) = {
            let mut state = self.inner.state.lock().await;
            if let Some(conns) = state.local_conns.get(service_name) {
                if !conns.is_empty() {
                    return Ok(conns.clone());
                }
            }
            (state.generation(service_name), state.options.merge(&opts))
        };

        debug!("Get conns for {} from remote", service_name);
        let addrs = self.inner.resolve_remote(service_name).await?;
        if addrs.is_empty() {
            let mut cached: Vec<String> = self
                .inner
                .state
                .lock()
                .await
                .local_conns
                .keys()
                .cloned()
                .collect();
            cached.sort();
            return Err(DiscoveryError::NoInstance {
                service: service_name.to_string(),
                cached,
                servers: self.inner.session.servers().to_vec(),
                root: self.inner.session.root().to_string(),
            });
        }

        let mut conns = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            match options.dial(&addr.addr).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    error!("Dial to {} for {} failed: {}", addr.addr, service_name, e);
                    return Err(e);
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.generation(service_name) == generation {
            state
                .local_conns
                .insert(service_name.to_string(), conns.clone());
        } else {
            debug!("Membership of {} changed during lookup, not caching", service_name);
        }
        Ok(conns)
    }

    /// A balanced channel for `scheme:///service_name` that follows
    /// membership changes through its own resolver. The resolver stops when
    /// the channel is dropped or on `unregister`.
    pub async fn get_conn(&self, service_name: &str, opts: DialOptions) -> Result<Channel> {
        check_name("service name", service_name)?;
        debug!("Get conn for {}", service_name);

        let options = self.inner.state.lock().await.options.merge(&opts);
        let (channel, tx) = Channel::balance_channel::<String>(BALANCE_CHANNEL_CAPACITY);
        let sink = Arc::new(BalanceSink::new(tx, self.inner.config.balancer, options));

        let target = Target::new(self.inner.config.scheme.clone(), service_name);
        self.build_resolver(&target.to_string(), sink).await?;
        Ok(channel)
    }

    /// Build a resolver for `target` that reports into `sink`. The handle
    /// is flushed on membership changes and refresh ticks until closed.
    pub async fn build_resolver(
        &self,
        target: &str,
        sink: Arc<dyn ResolverSink>,
    ) -> Result<Arc<ResolverHandle>> {
        let target = Target::parse(target)?;
        if target.scheme != self.inner.config.scheme {
            return Err(DiscoveryError::InvalidTarget {
                target: target.to_string(),
                reason: format!("expected scheme {}", self.inner.config.scheme),
            });
        }
        check_name("service name", &target.service_name)?;

        let id = self.inner.next_resolver_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ResolverHandle::new(
            id,
            target.service_name.clone(),
            self.inner.cancel.child_token(),
        ));
        self.inner
            .state
            .lock()
            .await
            .resolvers
            .entry(target.service_name.clone())
            .or_default()
            .push(handle.clone());

        self.inner
            .spawn(resolver::run(self.inner.clone(), handle.clone(), sink));
        handle.resolve_now();
        debug!("Built resolver {} for {}", id, target);
        Ok(handle)
    }

    /// Pre-create subtree nodes for several services.
    pub async fn create_service_nodes(&self, service_names: &[&str]) -> Result<()> {
        for service_name in service_names {
            check_name("service name", service_name)?;
            self.inner.session.ensure_service(service_name).await?;
        }
        Ok(())
    }

    pub async fn register_conf(&self, key: &str, conf: &[u8]) -> Result<()> {
        check_name("config key", key)?;
        let path = join_path(self.inner.session.root(), key);
        self.inner.session.put(&path, conf).await?;
        debug!("Stored {} bytes of config at {}", conf.len(), path);
        Ok(())
    }

    pub async fn get_conf(&self, key: &str) -> Result<Vec<u8>> {
        check_name("config key", key)?;
        let path = join_path(self.inner.session.root(), key);
        self.inner.session.get(&path).await
    }

    pub async fn get_self_conn_target(&self) -> Option<String> {
        self.registration().await.map(|r| r.addr)
    }

    pub async fn add_option(&self, opts: DialOptions) {
        let mut state = self.inner.state.lock().await;
        state.options = state.options.merge(&opts);
    }

    /// Stop the background tasks and close the store session.
    pub async fn close(&self) {
        info!("Close zk called");
        self.inner.cancel.cancel();
        self.inner.session.close().await;
    }
}

impl Drop for ZkClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[async_trait]
impl Conn for ZkClient {
    async fn get_conns(&self, service_name: &str, opts: DialOptions) -> Result<Vec<Channel>> {
        ZkClient::get_conns(self, service_name, opts).await
    }

    async fn get_conn(&self, service_name: &str, opts: DialOptions) -> Result<Channel> {
        ZkClient::get_conn(self, service_name, opts).await
    }

    async fn get_self_conn_target(&self) -> Option<String> {
        ZkClient::get_self_conn_target(self).await
    }

    async fn add_option(&self, opts: DialOptions) {
        ZkClient::add_option(self, opts).await
    }
}

#[async_trait]
impl SvcDiscoveryRegistry for ZkClient {
    async fn register(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        opts: DialOptions,
    ) -> Result<()> {
        ZkClient::register(self, service_name, host, port, opts).await
    }

    async fn unregister(&self) -> Result<()> {
        ZkClient::unregister(self).await
    }

    async fn register_conf(&self, key: &str, conf: &[u8]) -> Result<()> {
        ZkClient::register_conf(self, key, conf).await
    }

    async fn get_conf(&self, key: &str) -> Result<Vec<u8>> {
        ZkClient::get_conf(self, key).await
    }

    async fn close(&self) {
        ZkClient::close(self).await
    }
}
