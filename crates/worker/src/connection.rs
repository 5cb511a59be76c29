//! Data-exchange connections and the handle to their transport channel.

use crate::memory::{Budget, Buffer, BufferAllocator};
use crate::proxy::AllocatorProxy;
use floe_api::{FragmentHandle, NodeEndpoint};
use floe_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// The transport side of a connection. Closing fires the signal the I/O task
/// waits on.
#[derive(Debug)]
pub struct DataChannel {
    remote: NodeEndpoint,
    close_signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl DataChannel {
    pub fn new(remote: NodeEndpoint) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let channel = Self {
            remote,
            close_signal: Mutex::new(Some(tx)),
        };
        (channel, rx)
    }

    pub fn remote(&self) -> &NodeEndpoint {
        &self.remote
    }

    /// Returns `true` only for the call that actually closed the channel.
    pub fn close(&self) -> bool {
        match self.close_signal.lock().take() {
            Some(tx) => {
                // The I/O task may already be gone; closing still counts.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_signal.lock().is_none()
    }
}

#[derive(Debug)]
enum AllocatorRef {
    /// Accepted, destination fragment not attached yet.
    Pending(Arc<AllocatorProxy>),
    Attached(Budget),
}

/// An inbound connection carrying batches for one destination fragment.
///
/// Until a fragment manager attaches, the connection allocates through an
/// unbound [`AllocatorProxy`], so any buffer traffic fails loudly with
/// [`Error::UnboundAllocator`]. Attaching replaces the proxy with the
/// fragment's budget.
#[derive(Debug)]
pub struct DataConnection {
    id: Uuid,
    destination: FragmentHandle,
    channel: DataChannel,
    allocator: RwLock<AllocatorRef>,
}

impl DataConnection {
    pub fn new(destination: FragmentHandle, channel: DataChannel) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            channel,
            allocator: RwLock::new(AllocatorRef::Pending(Arc::new(AllocatorProxy::new()))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The fragment the remote peer said this connection feeds.
    pub fn destination(&self) -> &FragmentHandle {
        &self.destination
    }

    pub fn remote(&self) -> &NodeEndpoint {
        self.channel.remote()
    }

    /// The allocator buffers for this connection are charged to right now.
    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        match &*self.allocator.read() {
            AllocatorRef::Pending(proxy) => Arc::clone(proxy) as Arc<dyn BufferAllocator>,
            AllocatorRef::Attached(budget) => Arc::new(budget.clone()) as Arc<dyn BufferAllocator>,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(&*self.allocator.read(), AllocatorRef::Attached(_))
    }

    /// Swaps the pending proxy for `budget`.
    ///
    /// The proxy is bound on the way out so handles taken before the swap
    /// charge the same budget.
    pub(crate) fn attach_budget(&self, budget: Budget) -> Result<()> {
        let mut allocator = self.allocator.write();
        let proxy = match &*allocator {
            AllocatorRef::Pending(proxy) => Arc::clone(proxy),
            AllocatorRef::Attached(_) => return Err(Error::AlreadyAttached(self.id)),
        };
        proxy.bind(&budget)?;
        *allocator = AllocatorRef::Attached(budget);
        drop(allocator);

        debug!(
            connection = %self.id,
            destination = %self.destination,
            remote = %self.channel.remote(),
            "attached data connection"
        );
        Ok(())
    }

    /// Copies an inbound payload into a buffer charged to the connection's
    /// current allocator.
    pub fn receive(&self, payload: &[u8]) -> Result<Buffer> {
        if self.channel.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }
        let mut buffer = self.allocator().buffer(payload.len())?;
        buffer.copy_from_slice(payload);
        Ok(buffer)
    }

    pub fn close(&self) -> bool {
        let closed = self.channel.close();
        if closed {
            debug!(connection = %self.id, destination = %self.destination, "closed data connection");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}
