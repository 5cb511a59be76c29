//! Periodic stall detection over the fragment tracker.

use crate::config::Settings;
use crate::tracker::FragmentTracker;
use floe_api::FragmentHandle;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Spawns the stall monitor.
///
/// Every `sweep_interval` the tracker is swept with `stall_threshold`; each
/// newly stalled fragment is sent on `stalled` once. A fragment is reported
/// again only after it dropped off the stalled list in between. The monitor
/// never cancels anything itself. It stops when `shutdown` fires or the
/// receiving side of `stalled` is dropped.
pub fn spawn_stall_monitor(
    tracker: Arc<FragmentTracker>,
    settings: &Settings,
    stalled: mpsc::Sender<FragmentHandle>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    let period = settings.sweep_interval();
    let threshold = settings.stall_threshold();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported: HashSet<FragmentHandle> = HashSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("stall monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = tracker.clock().now();
            let current: HashSet<FragmentHandle> =
                tracker.sweep_stalled(threshold, now).into_iter().collect();
            reported.retain(|handle| current.contains(handle));

            for handle in current {
                if reported.contains(&handle) {
                    continue;
                }
                warn!(handle = %handle, threshold_secs = threshold.num_seconds(), "fragment has stalled");
                if stalled.send(handle.clone()).await.is_err() {
                    debug!("stall listener has gone away, stopping monitor");
                    return;
                }
                reported.insert(handle);
            }
        }
    })
}
