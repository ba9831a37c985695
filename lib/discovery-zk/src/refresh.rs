//! Periodic backstop against missed or coalesced watch deliveries

use crate::client::Inner;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) async fn refresh(inner: Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("zk refresh loop cancelled");
                return;
            }
            _ = ticker.tick() => {
                debug!("zk refresh local conns");
                inner.state.lock().await.invalidate_all();
                debug!("zk refresh local conns success");
            }
        }
    }
}
