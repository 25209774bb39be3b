//! VM reachability monitor
//!
//! Periodically probes the control session and publishes edge transitions
//! on a watch channel. The reconciler consumes the transitions; it never
//! probes on its own.

use qmp::{DEFAULT_ALIVE_TIMEOUT, QmpClient};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Spawn the reachability poller.
///
/// The returned receiver starts at `false`; every change of the probed
/// liveness flips it. The poller exits once all receivers are dropped.
pub fn spawn(client: QmpClient, interval: Duration) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let alive = client.is_alive(DEFAULT_ALIVE_TIMEOUT).await;
            let changed = tx.send_if_modified(|current| {
                if *current != alive {
                    *current = alive;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!(reachable = alive, "VM reachability changed");
            }
        }
    });

    rx
}
