//! Background expiry of chunked uploads that were abandoned mid-way.

use super::storage_service::FileStorage;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// How often to look for stale sessions given their time-to-live.
pub fn sweep_interval(ttl: Duration) -> Duration {
    (ttl / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

/// Spawn a task that purges sessions idle for longer than `ttl`.
pub fn spawn_stale_upload_sweeper(storage: FileStorage, ttl: Duration) -> JoinHandle<()> {
    let period = sweep_interval(ttl);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match storage.purge_stale_uploads(ttl).await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "removed stale chunked uploads"),
                Err(err) => warn!(error = %err, "stale upload sweep failed"),
            }
        }
    })
}
