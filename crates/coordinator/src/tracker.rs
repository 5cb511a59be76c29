//! Registry of fragment execution records for in-flight queries.

use crate::fragment::{FragmentRecord, FragmentSnapshot};
use chrono::{DateTime, Duration, Utc};
use floe_api::{FragmentHandle, FragmentState, FragmentStatus, MinorFragmentProfile, NodeEndpoint, QueryId};
use floe_common::{Clock, Error, Result, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Published whenever an accepted status update changes a fragment's state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub handle: FragmentHandle,
    pub endpoint: NodeEndpoint,
    pub state: FragmentState,
}

pub struct FragmentTracker {
    records: RwLock<HashMap<FragmentHandle, Arc<FragmentRecord>>>,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::UnboundedSender<StateChange>>,
}

impl Default for FragmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
            events: None,
        }
    }

    /// Sends a [`StateChange`] to `events` for every state transition.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<StateChange>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts tracking a freshly dispatched fragment in state `SENDING`.
    pub fn register(
        &self,
        handle: FragmentHandle,
        endpoint: NodeEndpoint,
        is_local: bool,
    ) -> Result<Arc<FragmentRecord>> {
        let mut records = self.records.write();
        if records.contains_key(&handle) {
            return Err(Error::DuplicateFragment(handle));
        }
        let record = Arc::new(FragmentRecord::new(
            handle.clone(),
            endpoint,
            is_local,
            self.clock.now(),
        ));
        records.insert(handle.clone(), Arc::clone(&record));
        drop(records);

        debug!(handle = %handle, endpoint = %record.endpoint(), is_local, "registered fragment");
        Ok(record)
    }

    /// Applies a status update from a worker.
    ///
    /// Returns whether the fragment's state changed. Updates for fragments
    /// already in a terminal state are discarded and return `Ok(false)`.
    pub fn update(&self, status: FragmentStatus) -> Result<bool> {
        let FragmentStatus { handle, profile } = status;
        let handle =
            handle.ok_or_else(|| Error::MalformedStatus("missing fragment handle".to_string()))?;
        let profile = profile.ok_or_else(|| {
            Error::MalformedStatus(format!("status for {} carries no profile", handle))
        })?;
        self.apply(&handle, profile)
    }

    fn apply(&self, handle: &FragmentHandle, profile: MinorFragmentProfile) -> Result<bool> {
        FragmentState::try_from(profile.state).map_err(|_| Error::InvalidState(profile.state))?;
        let record = self.record(handle)?;
        Ok(record.report_with(profile, self.clock.as_ref(), |state| {
            self.publish(&record, state)
        }))
    }

    /// Runs under the record's lock, so events for one fragment leave in the
    /// order its transitions were applied.
    fn publish(&self, record: &FragmentRecord, state: FragmentState) {
        debug!(handle = %record.handle(), state = %state, "fragment changed state");
        if let Some(events) = &self.events {
            let change = StateChange {
                handle: record.handle().clone(),
                endpoint: record.endpoint().clone(),
                state,
            };
            if events.send(change).is_err() {
                debug!(handle = %record.handle(), "state change listener has gone away");
            }
        }
    }

    /// Requests cancellation through the same terminal guard as worker
    /// reports. A fragment that already finished or failed stays as is.
    pub fn cancel(&self, handle: &FragmentHandle) -> Result<bool> {
        let record = self.record(handle)?;
        let changed = record.cancel_with(self.clock.as_ref(), |state| self.publish(&record, state));
        if changed {
            info!(handle = %handle, "cancelled fragment");
        }
        Ok(changed)
    }

    pub fn record(&self, handle: &FragmentHandle) -> Result<Arc<FragmentRecord>> {
        self.records
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::UnknownFragment(handle.clone()))
    }

    pub fn snapshot(&self, handle: &FragmentHandle) -> Result<FragmentSnapshot> {
        Ok(self.record(handle)?.snapshot())
    }

    /// Snapshots of every tracked fragment, ordered by query, major and minor id.
    pub fn all_snapshots(&self) -> Vec<FragmentSnapshot> {
        let mut snapshots: Vec<_> = self.records().iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| handle_order(&s.handle));
        snapshots
    }

    /// Handles of non-terminal fragments whose last progress is older than
    /// `threshold` at `now`. Does not change any record.
    pub fn sweep_stalled(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<FragmentHandle> {
        let mut stalled: Vec<_> = self
            .records()
            .iter()
            .map(|r| r.snapshot())
            .filter(|s| !s.state.is_terminal() && now - s.last_progress > threshold)
            .map(|s| s.handle)
            .collect();
        stalled.sort_by_key(handle_order);
        stalled
    }

    /// Drops every record belonging to `query_id`.
    pub fn forget_query(&self, query_id: &QueryId) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|handle, _| handle.query_id.as_ref() != Some(query_id));
        let removed = before - records.len();
        drop(records);

        debug!(query_id = %query_id, removed, "discarded query bookkeeping");
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn records(&self) -> Vec<Arc<FragmentRecord>> {
        self.records.read().values().cloned().collect()
    }
}

fn handle_order(handle: &FragmentHandle) -> (Option<(i64, i64)>, i32, i32) {
    (
        handle.query_id.map(|q| (q.part1, q.part2)),
        handle.major_fragment_id,
        handle.minor_fragment_id,
    )
}
