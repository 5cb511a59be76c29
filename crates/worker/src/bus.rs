//! Rendezvous between inbound data connections and local fragment managers.

use crate::connection::{DataChannel, DataConnection};
use crate::manager::FragmentManager;
use floe_api::{FragmentHandle, NodeEndpoint};
use floe_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct BusState {
    managers: HashMap<FragmentHandle, Arc<FragmentManager>>,
    /// Connections whose destination manager has not registered yet.
    parked: HashMap<FragmentHandle, Vec<Arc<DataConnection>>>,
}

/// Routes data connections to the fragment manager they name.
///
/// A connection may show up before or after its manager. Either way it is
/// attached exactly once, as soon as both sides are known.
#[derive(Debug, Default)]
pub struct WorkBus {
    state: Mutex<BusState>,
}

impl WorkBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a connection from `remote` addressed to `destination`.
    ///
    /// The returned receiver fires when the connection is closed; the
    /// transport's I/O task should stop on it.
    pub fn accept(
        &self,
        remote: NodeEndpoint,
        destination: FragmentHandle,
    ) -> Result<(Arc<DataConnection>, oneshot::Receiver<()>)> {
        let (channel, closed) = DataChannel::new(remote);
        let connection = Arc::new(DataConnection::new(destination.clone(), channel));

        let manager = {
            let mut state = self.state.lock();
            let registered = state.managers.get(&destination).cloned();
            match registered {
                Some(manager) => manager,
                None => {
                    state
                        .parked
                        .entry(destination)
                        .or_default()
                        .push(Arc::clone(&connection));
                    debug!(connection = %connection.id(), "parked data connection until its fragment starts");
                    return Ok((connection, closed));
                }
            }
        };

        manager.attach(Arc::clone(&connection))?;
        Ok((connection, closed))
    }

    /// Registers a manager and attaches every connection parked for it.
    /// Returns how many parked connections were attached.
    ///
    /// Every parked connection is tried. One that cannot attach is closed.
    /// If any attach failed, the manager is unregistered again and the first
    /// error is returned; connections that did attach stay with the manager
    /// and close when it terminates.
    pub fn register(&self, manager: Arc<FragmentManager>) -> Result<usize> {
        let handle = manager.handle().clone();
        let parked = {
            let mut state = self.state.lock();
            if state.managers.contains_key(&handle) {
                return Err(Error::DuplicateFragment(handle));
            }
            state.managers.insert(handle.clone(), Arc::clone(&manager));
            state.parked.remove(&handle).unwrap_or_default()
        };

        let mut attached = 0;
        let mut first_error = None;
        for connection in parked {
            match manager.attach(Arc::clone(&connection)) {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(handle = %handle, connection = %connection.id(), error = %e, "closing data connection that failed to attach");
                    connection.close();
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            let mut state = self.state.lock();
            if state
                .managers
                .get(&handle)
                .is_some_and(|registered| Arc::ptr_eq(registered, &manager))
            {
                state.managers.remove(&handle);
            }
            return Err(e);
        }
        debug!(handle = %handle, attached, "registered fragment manager");
        Ok(attached)
    }

    /// Terminates the manager for `handle` and closes any connection still
    /// waiting for it. Returns the number of connections closed.
    pub fn retire(&self, handle: &FragmentHandle) -> Result<usize> {
        let (manager, parked) = {
            let mut state = self.state.lock();
            (state.managers.remove(handle), state.parked.remove(handle))
        };
        if manager.is_none() && parked.is_none() {
            return Err(Error::UnknownFragment(handle.clone()));
        }

        let mut closed = 0;
        if let Some(parked) = parked {
            warn!(handle = %handle, count = parked.len(), "closing data connections that never attached");
            closed += parked.iter().filter(|c| c.close()).count();
        }
        if let Some(manager) = manager {
            closed += manager.terminate()?;
        }
        Ok(closed)
    }

    /// Receives `payload` on `connection` and queues it for its fragment.
    pub fn deliver(&self, connection: &DataConnection, payload: &[u8]) -> Result<()> {
        let buffer = connection.receive(payload)?;
        let manager = self
            .manager(connection.destination())
            .ok_or_else(|| Error::UnknownFragment(connection.destination().clone()))?;
        manager.enqueue(buffer)
    }

    pub fn manager(&self, handle: &FragmentHandle) -> Option<Arc<FragmentManager>> {
        self.state.lock().managers.get(handle).cloned()
    }

    pub fn parked_count(&self, handle: &FragmentHandle) -> usize {
        self.state.lock().parked.get(handle).map_or(0, Vec::len)
    }
}
