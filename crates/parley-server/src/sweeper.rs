//! Periodic purge of expired fast-cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_store::FastCache;

/// Purge `cache` every `every` until `cancel` fires. The first purge runs one
/// interval after start.
pub fn spawn_cache_sweeper(
    cache: Arc<dyn FastCache>,
    every: Duration,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let cancel = cancel.child_token();
    tokio::spawn(async move {
        let mut ticks = time::interval_at(time::Instant::now() + every, every);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    match cache.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "cache sweep"),
                        Err(e) => warn!(error = %e, "cache sweep failed"),
                    }
                }
                () = cancel.cancelled() => {
                    debug!("cache sweeper stopped");
                    return;
                }
            }
        }
    })
}
