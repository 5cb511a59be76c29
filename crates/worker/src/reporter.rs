//! Periodic status reporting from a running fragment to the coordinator.

use crate::manager::FragmentManager;
use floe_api::{FragmentState, FragmentStatus, OperatorProfile};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// What the executing fragment last published about itself.
#[derive(Debug, Clone)]
pub struct FragmentProgress {
    pub state: FragmentState,
    pub operators: Vec<OperatorProfile>,
}

impl Default for FragmentProgress {
    fn default() -> Self {
        Self {
            state: FragmentState::AwaitingAllocation,
            operators: Vec::new(),
        }
    }
}

/// Spawns the reporter for `manager`.
///
/// A status is sent every `period`, and immediately once `progress` turns
/// terminal; the terminal status is the last one sent. The task also stops
/// when either `progress` or `sink` is closed.
pub fn spawn_status_reporter(
    manager: Arc<FragmentManager>,
    mut progress: watch::Receiver<FragmentProgress>,
    period: Duration,
    sink: mpsc::Sender<FragmentStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = progress.changed() => {
                    if changed.is_err() {
                        debug!(handle = %manager.handle(), "fragment progress closed, stopping reporter");
                        return;
                    }
                    if !progress.borrow().state.is_terminal() {
                        continue;
                    }
                }
            }

            let FragmentProgress { state, operators } = progress.borrow_and_update().clone();
            let status = manager.status_report(state, operators);
            trace!(handle = %manager.handle(), state = %state, "sending fragment status");
            if sink.send(status).await.is_err() {
                debug!(handle = %manager.handle(), "status sink closed, stopping reporter");
                return;
            }
            if state.is_terminal() {
                return;
            }
        }
    })
}
