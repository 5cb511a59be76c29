//! Execution record of a single dispatched fragment.

use chrono::{DateTime, Utc};
use floe_api::{FragmentHandle, FragmentState, MinorFragmentProfile, NodeEndpoint, OperatorProfile};
use floe_common::Clock;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Everything a status report is allowed to change. Swapped as a unit.
#[derive(Debug)]
struct Observation {
    profile: MinorFragmentProfile,
    last_status_update: DateTime<Utc>,
    last_progress: DateTime<Utc>,
}

/// Consistent view of a record at one instant.
#[derive(Debug, Clone)]
pub struct FragmentSnapshot {
    pub handle: FragmentHandle,
    pub endpoint: NodeEndpoint,
    pub is_local: bool,
    pub state: FragmentState,
    /// Latest reported profile with `last_update` and `last_progress` filled in.
    pub profile: MinorFragmentProfile,
    pub last_status_update: DateTime<Utc>,
    pub last_progress: DateTime<Utc>,
}

/// Coordinator-side state machine for one fragment.
///
/// Once the fragment reaches a terminal state the record is frozen: later
/// reports are counted, logged and otherwise ignored.
pub struct FragmentRecord {
    handle: FragmentHandle,
    endpoint: NodeEndpoint,
    is_local: bool,
    current: Mutex<Arc<Observation>>,
    rejected_reports: AtomicU64,
}

impl FragmentRecord {
    pub fn new(
        handle: FragmentHandle,
        endpoint: NodeEndpoint,
        is_local: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        let profile = MinorFragmentProfile {
            state: FragmentState::Sending as i32,
            minor_fragment_id: handle.minor_fragment_id,
            endpoint: Some(endpoint.clone()),
            ..Default::default()
        };
        Self {
            handle,
            endpoint,
            is_local,
            current: Mutex::new(Arc::new(Observation {
                profile,
                last_status_update: created_at,
                last_progress: created_at,
            })),
            rejected_reports: AtomicU64::new(0),
        }
    }

    /// Applies a status report received at `now`.
    ///
    /// Returns whether the fragment state changed. Reports arriving after a
    /// terminal state return `false` and leave the record untouched.
    pub fn report(&self, profile: MinorFragmentProfile, now: DateTime<Utc>) -> bool {
        let mut current = self.current.lock();
        self.apply(&mut current, profile, now)
    }

    /// Like [`FragmentRecord::report`], but reads `clock` and runs
    /// `on_change` with the new state while the record is still locked, so
    /// timestamps never go backwards and transitions are observed in the
    /// order they were applied.
    pub fn report_with<F>(&self, profile: MinorFragmentProfile, clock: &dyn Clock, on_change: F) -> bool
    where
        F: FnOnce(FragmentState),
    {
        let mut current = self.current.lock();
        let state = profile.state();
        let changed = self.apply(&mut current, profile, clock.now());
        if changed {
            on_change(state);
        }
        changed
    }

    /// Moves the fragment to `CANCELLED`, keeping the operator profiles of
    /// the latest accepted report. Terminal fragments stay as they are.
    pub fn cancel_with<F>(&self, clock: &dyn Clock, on_change: F) -> bool
    where
        F: FnOnce(FragmentState),
    {
        let mut current = self.current.lock();
        let mut profile = current.profile.clone();
        profile.state = FragmentState::Cancelled as i32;
        let changed = self.apply(&mut current, profile, clock.now());
        if changed {
            on_change(FragmentState::Cancelled);
        }
        changed
    }

    fn apply(
        &self,
        current: &mut Arc<Observation>,
        profile: MinorFragmentProfile,
        now: DateTime<Utc>,
    ) -> bool {
        let old_state = current.profile.state();
        let new_state = profile.state();

        if old_state.is_terminal() {
            self.rejected_reports.fetch_add(1, Ordering::Relaxed);
            warn!(
                handle = %self.handle,
                old_state = %old_state,
                new_state = %new_state,
                "received status for fragment after it reached a terminal state"
            );
            return false;
        }

        let state_changed = new_state != old_state;
        let last_progress = if made_progress(&current.profile, &profile) {
            now
        } else {
            current.last_progress
        };
        *current = Arc::new(Observation {
            profile,
            last_status_update: now,
            last_progress,
        });

        trace!(handle = %self.handle, state = %new_state, state_changed, "applied fragment status");
        state_changed
    }

    fn observation(&self) -> Arc<Observation> {
        Arc::clone(&*self.current.lock())
    }

    pub fn handle(&self) -> &FragmentHandle {
        &self.handle
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn state(&self) -> FragmentState {
        self.observation().profile.state()
    }

    pub fn last_status_update(&self) -> DateTime<Utc> {
        self.observation().last_status_update
    }

    pub fn last_progress(&self) -> DateTime<Utc> {
        self.observation().last_progress
    }

    /// Latest profile with the liveness timestamps merged in as epoch millis.
    pub fn profile(&self) -> MinorFragmentProfile {
        merged_profile(&self.observation())
    }

    /// Operator profiles of the latest accepted report.
    pub fn operator_profiles(&self) -> Vec<OperatorProfile> {
        self.observation().profile.operator_profile.clone()
    }

    /// Number of reports discarded because the fragment was already terminal.
    pub fn rejected_reports(&self) -> u64 {
        self.rejected_reports.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FragmentSnapshot {
        let observation = self.observation();
        FragmentSnapshot {
            handle: self.handle.clone(),
            endpoint: self.endpoint.clone(),
            is_local: self.is_local,
            state: observation.profile.state(),
            profile: merged_profile(&observation),
            last_status_update: observation.last_status_update,
            last_progress: observation.last_progress,
        }
    }
}

impl fmt::Debug for FragmentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observation = self.observation();
        f.debug_struct("FragmentRecord")
            .field("handle", &self.handle.to_string())
            .field("endpoint", &self.endpoint.to_string())
            .field("is_local", &self.is_local)
            .field("state", &observation.profile.state())
            .field("last_status_update", &observation.last_status_update)
            .field("last_progress", &observation.last_progress)
            .finish()
    }
}

fn merged_profile(observation: &Observation) -> MinorFragmentProfile {
    let mut profile = observation.profile.clone();
    profile.last_update = observation.last_status_update.timestamp_millis();
    profile.last_progress = observation.last_progress.timestamp_millis();
    profile
}

/// Whether `current` shows any movement relative to `previous`.
///
/// Any difference counts, including shrinking operator or metric lists.
pub fn made_progress(previous: &MinorFragmentProfile, current: &MinorFragmentProfile) -> bool {
    if previous.state != current.state {
        return true;
    }
    if previous.operator_profile.len() != current.operator_profile.len() {
        return true;
    }
    previous
        .operator_profile
        .iter()
        .zip(&current.operator_profile)
        .any(|(prev, cur)| operator_progressed(prev, cur))
}

fn operator_progressed(prev: &OperatorProfile, cur: &OperatorProfile) -> bool {
    prev.input_profile.len() != cur.input_profile.len()
        || prev.input_profile != cur.input_profile
        || prev.metric.len() != cur.metric.len()
        || prev.metric != cur.metric
}
