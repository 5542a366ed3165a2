//! Periodic retention sweeper.
//!
//! Runs the measurement cleanup once per hour with the configured
//! retention horizon. Alerts are retained indefinitely.

use gateway_store::Store;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention sweeper worker.
pub fn spawn_retention_sweeper(
    store: Store,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.cleanup_older_than(retention_days) {
                        Ok(0) => {}
                        Ok(deleted) => {
                            info!(deleted, retention_days, "retention sweep removed measurements");
                        }
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
