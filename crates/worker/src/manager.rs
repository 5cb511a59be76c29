//! Worker-side owner of one running fragment.

use crate::connection::DataConnection;
use crate::memory::{Budget, Buffer, BufferAllocator};
use chrono::{DateTime, Utc};
use floe_api::{
    FragmentHandle, FragmentState, FragmentStatus, MinorFragmentProfile, NodeEndpoint,
    OperatorProfile,
};
use floe_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FragmentContext {
    pub handle: FragmentHandle,
    pub endpoint: NodeEndpoint,
    pub budget: Budget,
    pub started_at: DateTime<Utc>,
}

impl FragmentContext {
    pub fn new(handle: FragmentHandle, endpoint: NodeEndpoint, budget: Budget) -> Self {
        Self {
            handle,
            endpoint,
            budget,
            started_at: Utc::now(),
        }
    }
}

/// Owns a fragment's budget and the data connections feeding it.
///
/// Connections attached here allocate straight from the fragment budget.
/// [`FragmentManager::terminate`] closes every attached connection exactly
/// once and releases the budget.
#[derive(Debug)]
pub struct FragmentManager {
    context: FragmentContext,
    connections: Mutex<Vec<Arc<DataConnection>>>,
    inbound: mpsc::UnboundedSender<Buffer>,
    terminated: AtomicBool,
}

impl FragmentManager {
    /// Returns the manager and the receiving end of its inbound batch queue.
    pub fn new(context: FragmentContext) -> (Arc<Self>, mpsc::UnboundedReceiver<Buffer>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            context,
            connections: Mutex::new(Vec::new()),
            inbound,
            terminated: AtomicBool::new(false),
        });
        (manager, rx)
    }

    pub fn handle(&self) -> &FragmentHandle {
        &self.context.handle
    }

    pub fn context(&self) -> &FragmentContext {
        &self.context
    }

    pub fn budget(&self) -> &Budget {
        &self.context.budget
    }

    /// Takes ownership of `connection` and points its allocator at this
    /// fragment's budget.
    ///
    /// A connection arriving after termination is closed on the spot.
    pub fn attach(&self, connection: Arc<DataConnection>) -> Result<()> {
        if connection.destination() != &self.context.handle {
            return Err(Error::Internal(format!(
                "connection {} is addressed to {}, not {}",
                connection.id(),
                connection.destination(),
                self.context.handle
            )));
        }

        let mut connections = self.connections.lock();
        if self.terminated.load(Ordering::Acquire) {
            drop(connections);
            connection.close();
            return Err(Error::FragmentTerminated(self.context.handle.clone()));
        }
        connection.attach_budget(self.context.budget.clone())?;
        connections.push(connection);
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Hands a received batch to the fragment's consumer.
    pub fn enqueue(&self, buffer: Buffer) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::FragmentTerminated(self.context.handle.clone()));
        }
        self.inbound
            .send(buffer)
            .map_err(|_| Error::FragmentTerminated(self.context.handle.clone()))
    }

    /// Builds the status message the coordinator's tracker consumes.
    pub fn status_report(
        &self,
        state: FragmentState,
        operators: Vec<OperatorProfile>,
    ) -> FragmentStatus {
        let budget = &self.context.budget;
        let profile = MinorFragmentProfile {
            state: state as i32,
            minor_fragment_id: self.context.handle.minor_fragment_id,
            operator_profile: operators,
            start_time: self.context.started_at.timestamp_millis(),
            end_time: if state.is_terminal() {
                Utc::now().timestamp_millis()
            } else {
                0
            },
            memory_used: clamp(budget.allocated()),
            max_memory_used: clamp(budget.peak()),
            endpoint: Some(self.context.endpoint.clone()),
            ..Default::default()
        };
        FragmentStatus {
            handle: Some(self.context.handle.clone()),
            profile: Some(profile),
        }
    }

    /// Closes every attached connection once and releases the budget.
    ///
    /// Only the first call does anything; it returns how many connections it
    /// closed. Later calls return `Ok(0)`.
    pub fn terminate(&self) -> Result<usize> {
        let connections = {
            let mut connections = self.connections.lock();
            if self.terminated.swap(true, Ordering::AcqRel) {
                return Ok(0);
            }
            std::mem::take(&mut *connections)
        };

        let closed = connections.iter().filter(|c| c.close()).count();
        debug!(handle = %self.context.handle, closed, "closed fragment connections");
        self.context.budget.release()?;
        info!(
            handle = %self.context.handle,
            connections = connections.len(),
            peak_bytes = self.context.budget.peak(),
            "terminated fragment"
        );
        Ok(closed)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

fn clamp(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
