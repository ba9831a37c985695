//! Per-target resolver handles handed to the RPC framework
//!
//! Each handle owns a task that waits for `resolve_now`, resolves the
//! service from the store and pushes the result into its sink. Requests that
//! arrive while a resolution is running collapse into one follow-up run.

use crate::client::Inner;
use discovery_core::{DiscoveryError, ResolverSink};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ResolverHandle {
    id: u64,
    service_name: String,
    notify: Notify,
    cancel: CancellationToken,
}

impl ResolverHandle {
    pub(crate) fn new(id: u64, service_name: String, cancel: CancellationToken) -> Self {
        Self {
            id,
            service_name,
            notify: Notify::new(),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Request a fresh resolution. Never blocks.
    pub fn resolve_now(&self) {
        self.notify.notify_one();
    }

    /// Stop resolving. The sink receives no further updates.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub(crate) async fn run(inner: Arc<Inner>, handle: Arc<ResolverHandle>, sink: Arc<dyn ResolverSink>) {
    loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            _ = sink.closed() => {
                debug!("Resolver consumer for {} went away", handle.service_name);
                break;
            }
            _ = handle.notify.notified() => {}
        }

        match inner.resolve_remote(&handle.service_name).await {
            Ok(addrs) => {
                debug!(
                    "Resolved {} addresses for {}",
                    addrs.len(),
                    handle.service_name
                );
                if let Err(e) = sink.update_state(addrs).await {
                    match e {
                        DiscoveryError::Closed => debug!(
                            "Resolver consumer for {} went away",
                            handle.service_name
                        ),
                        other => warn!(
                            "Resolver update for {} failed: {}",
                            handle.service_name, other
                        ),
                    }
                    break;
                }
            }
            Err(e) => sink.report_error(&e).await,
        }
    }

    handle.close();
    inner
        .state
        .lock()
        .await
        .remove_resolver(&handle.service_name, handle.id);
    debug!("Resolver {} for {} stopped", handle.id, handle.service_name);
}
