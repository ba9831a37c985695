//! Bridge between discovery results and the RPC framework's resolver state

use crate::{Address, BalancingPolicy, DialOptions, DiscoveryError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, Mutex};
use tonic::transport::channel::Change;
use tonic::transport::Endpoint;
use tracing::{debug, warn};

/// Receives resolution results for one logical target.
#[async_trait]
pub trait ResolverSink: Send + Sync + 'static {
    /// Replace the target's address set.
    ///
    /// Returns `DiscoveryError::Closed` once the consumer has gone away, which
    /// tells the resolver to stop.
    async fn update_state(&self, addrs: Vec<Address>) -> Result<()>;

    /// Surface a failed resolution. The previous address set stays in effect.
    async fn report_error(&self, err: &DiscoveryError);

    /// Completes once the consumer is gone and no update can be delivered.
    /// Sinks that never go away keep the default, which never completes.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Feeds a `Channel::balance_channel` with endpoint changes.
pub struct BalanceSink {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    policy: BalancingPolicy,
    options: DialOptions,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    current: BTreeSet<String>,
    last_error: Option<String>,
}

impl BalanceSink {
    pub fn new(
        tx: mpsc::Sender<Change<String, Endpoint>>,
        policy: BalancingPolicy,
        options: DialOptions,
    ) -> Self {
        Self {
            tx,
            policy,
            options,
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Addresses currently inserted into the channel
    pub async fn current(&self) -> Vec<String> {
        self.state.lock().await.current.iter().cloned().collect()
    }

    /// The most recent resolution error, cleared by the next successful update
    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    async fn send(&self, change: Change<String, Endpoint>) -> Result<()> {
        self.tx.send(change).await.map_err(|_| DiscoveryError::Closed)
    }
}

#[async_trait]
impl ResolverSink for BalanceSink {
    async fn update_state(&self, addrs: Vec<Address>) -> Result<()> {
        let wanted: BTreeSet<String> = self
            .policy
            .select(&addrs)
            .iter()
            .map(|a| a.addr.clone())
            .collect();

        let mut state = self.state.lock().await;
        state.last_error = None;

        let removed: Vec<String> = state.current.difference(&wanted).cloned().collect();
        for addr in removed {
            self.send(Change::Remove(addr.clone())).await?;
            state.current.remove(&addr);
            debug!("Removed {} from balance channel", addr);
        }

        let added: Vec<String> = wanted.difference(&state.current).cloned().collect();
        for addr in added {
            let endpoint = match self.options.endpoint(&addr) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("Skipping address {}: {}", addr, e);
                    continue;
                }
            };
            self.send(Change::Insert(addr.clone(), endpoint)).await?;
            state.current.insert(addr.clone());
            debug!("Inserted {} into balance channel", addr);
        }

        Ok(())
    }

    async fn report_error(&self, err: &DiscoveryError) {
        warn!("Resolution failed, keeping previous addresses: {}", err);
        self.state.lock().await.last_error = Some(err.to_string());
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}
