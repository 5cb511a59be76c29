//! Stand-in allocator for data connections whose fragment is not known yet.

use crate::memory::{Budget, Buffer, BufferAllocator, PreAllocator, SystemAllocator, WeakBudget};
use floe_api::FragmentHandle;
use floe_common::{Error, Result};
use std::sync::OnceLock;

/// Forwards every call to a budget bound at most once.
///
/// Until [`AllocatorProxy::bind`] runs, every operation except `release`
/// fails with [`Error::UnboundAllocator`]; nothing is allocated and nothing
/// waits. The proxy never owns the budget it forwards to.
#[derive(Debug, Default)]
pub struct AllocatorProxy {
    target: OnceLock<WeakBudget>,
}

impl AllocatorProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, budget: &Budget) -> Result<()> {
        self.target
            .set(budget.downgrade())
            .map_err(|_| Error::AllocatorAlreadyBound)
    }

    pub fn is_bound(&self) -> bool {
        self.target.get().is_some()
    }

    fn bound(&self) -> Result<Budget> {
        let target = self.target.get().ok_or(Error::UnboundAllocator)?;
        target.upgrade().ok_or(Error::AllocatorDetached)
    }
}

impl BufferAllocator for AllocatorProxy {
    fn buffer(&self, size: usize) -> Result<Buffer> {
        self.bound()?.buffer(size)
    }

    fn buffer_in_range(&self, min_size: usize, max_size: usize) -> Result<Buffer> {
        self.bound()?.buffer_in_range(min_size, max_size)
    }

    fn underlying(&self) -> Result<SystemAllocator> {
        self.bound()?.underlying()
    }

    fn child(
        &self,
        handle: &FragmentHandle,
        initial_reservation: u64,
        max_reservation: u64,
    ) -> Result<Budget> {
        self.bound()?
            .child(handle, initial_reservation, max_reservation)
    }

    fn pre_allocator(&self) -> Result<PreAllocator> {
        self.bound()?.pre_allocator()
    }

    fn allocated_bytes(&self) -> Result<u64> {
        self.bound()?.allocated_bytes()
    }

    /// No-op while unbound or once the budget is gone.
    fn release(&self) -> Result<()> {
        match self.target.get().and_then(WeakBudget::upgrade) {
            Some(budget) => budget.release(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_api::QueryId;

    #[test]
    fn unbound_proxy_refuses_everything_but_release() {
        let proxy = AllocatorProxy::new();
        let handle = FragmentHandle::new(QueryId::random(), 0, 0);

        assert!(matches!(proxy.buffer(16), Err(Error::UnboundAllocator)));
        assert!(matches!(proxy.buffer_in_range(1, 16), Err(Error::UnboundAllocator)));
        assert!(matches!(proxy.underlying(), Err(Error::UnboundAllocator)));
        assert!(matches!(proxy.child(&handle, 0, 16), Err(Error::UnboundAllocator)));
        assert!(matches!(proxy.pre_allocator(), Err(Error::UnboundAllocator)));
        assert!(matches!(proxy.allocated_bytes(), Err(Error::UnboundAllocator)));
        assert!(proxy.release().is_ok());
        assert!(!proxy.is_bound());
    }

    #[test]
    fn bound_proxy_forwards_to_budget() {
        let budget = Budget::root("fragment", 1024);
        let proxy = AllocatorProxy::new();
        proxy.bind(&budget).unwrap();
        assert!(proxy.is_bound());

        let buffer = proxy.buffer(100).unwrap();
        assert_eq!(budget.allocated(), 100);
        assert_eq!(proxy.allocated_bytes().unwrap(), 100);

        let child = proxy
            .child(&FragmentHandle::new(QueryId::random(), 1, 0), 10, 20)
            .unwrap();
        assert_eq!(budget.allocated(), 110);
        drop(child);
        assert_eq!(budget.allocated(), 100);
        drop(buffer);

        proxy.release().unwrap();
        assert!(budget.is_released());
    }

    #[test]
    fn proxy_binds_once() {
        let first = Budget::root("first", 64);
        let second = Budget::root("second", 64);
        let proxy = AllocatorProxy::new();
        proxy.bind(&first).unwrap();
        assert!(matches!(proxy.bind(&second), Err(Error::AllocatorAlreadyBound)));

        let _buffer = proxy.buffer(8).unwrap();
        assert_eq!(first.allocated(), 8);
        assert_eq!(second.allocated(), 0);
    }

    #[test]
    fn proxy_does_not_own_its_budget() {
        let budget = Budget::root("short-lived", 64);
        let proxy = AllocatorProxy::new();
        proxy.bind(&budget).unwrap();
        drop(budget);

        assert!(matches!(proxy.buffer(1), Err(Error::AllocatorDetached)));
        assert!(proxy.release().is_ok());
    }
}
