//! Memory budgets and the buffers they hand out.
//!
//! [`BufferAllocator`] is the surface the data plane programs against. The
//! in-process implementation is [`Budget`]: a tree of reservation-limited
//! accounts where every child charges its parent.

mod budget;

pub use budget::{Budget, WeakBudget};

use bytes::BytesMut;
use floe_api::FragmentHandle;
use floe_common::Result;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use budget::Ledger;

/// Allocation capabilities shared by budgets and the stand-ins used before a
/// budget is known.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Allocates a zeroed buffer of exactly `size` bytes.
    fn buffer(&self, size: usize) -> Result<Buffer>;

    /// Allocates `max_size` bytes if the budget allows it, otherwise `min_size`.
    fn buffer_in_range(&self, min_size: usize, max_size: usize) -> Result<Buffer>;

    /// The raw allocator underneath the accounting.
    fn underlying(&self) -> Result<SystemAllocator>;

    /// Mints a child budget for `handle`.
    ///
    /// `initial_reservation` is charged to this budget immediately; the child
    /// may never hold more than `max_reservation` bytes.
    fn child(
        &self,
        handle: &FragmentHandle,
        initial_reservation: u64,
        max_reservation: u64,
    ) -> Result<Budget>;

    fn pre_allocator(&self) -> Result<PreAllocator>;

    fn allocated_bytes(&self) -> Result<u64>;

    /// Gives everything still held back to the parent. Only the first call
    /// succeeds.
    fn release(&self) -> Result<()>;
}

/// Unaccounted allocator that backs every budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    pub fn allocate(&self, size: usize) -> BytesMut {
        BytesMut::zeroed(size)
    }
}

/// A block of memory charged to a budget until dropped.
pub struct Buffer {
    data: BytesMut,
    charged: u64,
    ledger: Option<Arc<Ledger>>,
}

impl Buffer {
    fn accounted(data: BytesMut, ledger: Arc<Ledger>) -> Self {
        Self {
            charged: data.len() as u64,
            data,
            ledger: Some(ledger),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.credit(self.charged);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("budget", &self.ledger.as_ref().map(|l| l.name()))
            .finish()
    }
}

/// Collects the sizes of several upcoming allocations and performs them as
/// one buffer.
#[derive(Debug)]
pub struct PreAllocator {
    budget: Budget,
    bytes: usize,
}

impl PreAllocator {
    pub(crate) fn new(budget: Budget) -> Self {
        Self { budget, bytes: 0 }
    }

    pub fn add_allocation(&mut self, bytes: usize) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    pub fn planned_bytes(&self) -> usize {
        self.bytes
    }

    pub fn allocate(self) -> Result<Buffer> {
        self.budget.buffer(self.bytes)
    }
}
