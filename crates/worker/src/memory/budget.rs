use super::{Buffer, BufferAllocator, PreAllocator, SystemAllocator};
use floe_api::FragmentHandle;
use floe_common::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Accounts {
    allocated: u64,
    peak: u64,
    released: bool,
}

/// Accounting node behind a [`Budget`].
///
/// `allocated` covers this node's own buffers plus whatever its children
/// charged to it. A node charges its parent `max(initial_reservation,
/// allocated)`. Locks are only ever taken child before parent.
pub(crate) struct Ledger {
    name: String,
    parent: Option<Arc<Ledger>>,
    initial_reservation: u64,
    max_reservation: u64,
    accounts: Mutex<Accounts>,
}

impl Ledger {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn footprint(&self, allocated: u64) -> u64 {
        allocated.max(self.initial_reservation)
    }

    /// All-or-nothing: on error neither this node nor any ancestor changed.
    fn charge(&self, bytes: u64) -> Result<()> {
        let mut accounts = self.accounts.lock();
        if accounts.released {
            return Err(Error::BudgetReleased(self.name.clone()));
        }
        let next = accounts
            .allocated
            .checked_add(bytes)
            .filter(|next| *next <= self.max_reservation)
            .ok_or_else(|| Error::OutOfBudget {
                budget: self.name.clone(),
                requested: bytes,
                allocated: accounts.allocated,
                limit: self.max_reservation,
            })?;

        if let Some(parent) = &self.parent {
            let delta = self.footprint(next) - self.footprint(accounts.allocated);
            if delta > 0 {
                parent.charge(delta)?;
            }
        }
        accounts.allocated = next;
        accounts.peak = accounts.peak.max(next);
        Ok(())
    }

    pub(crate) fn credit(&self, bytes: u64) {
        let mut accounts = self.accounts.lock();
        if accounts.released {
            return;
        }
        let next = accounts.allocated.saturating_sub(bytes);
        if let Some(parent) = &self.parent {
            let delta = self.footprint(accounts.allocated) - self.footprint(next);
            if delta > 0 {
                parent.credit(delta);
            }
        }
        accounts.allocated = next;
    }

    fn release(&self) -> Result<()> {
        let mut accounts = self.accounts.lock();
        if accounts.released {
            return Err(Error::BudgetReleased(self.name.clone()));
        }
        if accounts.allocated > 0 {
            warn!(
                budget = %self.name,
                outstanding = accounts.allocated,
                "releasing budget with outstanding allocations"
            );
        }
        if let Some(parent) = &self.parent {
            parent.credit(self.footprint(accounts.allocated));
        }
        accounts.allocated = 0;
        accounts.released = true;
        debug!(budget = %self.name, peak = accounts.peak, "released budget");
        Ok(())
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        let accounts = self.accounts.get_mut();
        if accounts.released {
            return;
        }
        if let Some(parent) = &self.parent {
            parent.credit(self.initial_reservation.max(accounts.allocated));
        }
    }
}

/// Handle to one node of the budget tree. Clones share the same accounts.
#[derive(Clone)]
pub struct Budget {
    ledger: Arc<Ledger>,
}

impl Budget {
    /// A top-level budget with no parent.
    pub fn root(name: impl Into<String>, limit: u64) -> Self {
        Self {
            ledger: Arc::new(Ledger {
                name: name.into(),
                parent: None,
                initial_reservation: 0,
                max_reservation: limit,
                accounts: Mutex::new(Accounts::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.ledger.name
    }

    pub fn limit(&self) -> u64 {
        self.ledger.max_reservation
    }

    pub fn initial_reservation(&self) -> u64 {
        self.ledger.initial_reservation
    }

    /// Bytes currently charged to this budget.
    pub fn allocated(&self) -> u64 {
        self.ledger.accounts.lock().allocated
    }

    /// Highest value `allocated` has reached.
    pub fn peak(&self) -> u64 {
        self.ledger.accounts.lock().peak
    }

    pub fn is_released(&self) -> bool {
        self.ledger.accounts.lock().released
    }

    pub fn downgrade(&self) -> WeakBudget {
        WeakBudget(Arc::downgrade(&self.ledger))
    }
}

impl BufferAllocator for Budget {
    fn buffer(&self, size: usize) -> Result<Buffer> {
        self.ledger.charge(size as u64)?;
        Ok(Buffer::accounted(
            SystemAllocator.allocate(size),
            Arc::clone(&self.ledger),
        ))
    }

    fn buffer_in_range(&self, min_size: usize, max_size: usize) -> Result<Buffer> {
        if min_size > max_size {
            return Err(Error::Internal(format!(
                "minimum buffer size {} exceeds maximum {}",
                min_size, max_size
            )));
        }
        match self.buffer(max_size) {
            Err(Error::OutOfBudget { .. }) if min_size < max_size => self.buffer(min_size),
            other => other,
        }
    }

    fn underlying(&self) -> Result<SystemAllocator> {
        Ok(SystemAllocator)
    }

    fn child(
        &self,
        handle: &FragmentHandle,
        initial_reservation: u64,
        max_reservation: u64,
    ) -> Result<Budget> {
        if initial_reservation > max_reservation {
            return Err(Error::InvalidReservation {
                initial: initial_reservation,
                max: max_reservation,
            });
        }
        self.ledger.charge(initial_reservation)?;

        let ledger = Ledger {
            name: format!("{}/{}", self.ledger.name, handle),
            parent: Some(Arc::clone(&self.ledger)),
            initial_reservation,
            max_reservation,
            accounts: Mutex::new(Accounts::default()),
        };
        debug!(
            budget = %ledger.name,
            initial_reservation,
            max_reservation,
            "created child budget"
        );
        Ok(Budget {
            ledger: Arc::new(ledger),
        })
    }

    fn pre_allocator(&self) -> Result<PreAllocator> {
        Ok(PreAllocator::new(self.clone()))
    }

    fn allocated_bytes(&self) -> Result<u64> {
        Ok(self.allocated())
    }

    fn release(&self) -> Result<()> {
        self.ledger.release()
    }
}

impl fmt::Debug for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let accounts = self.ledger.accounts.lock();
        f.debug_struct("Budget")
            .field("name", &self.ledger.name)
            .field("allocated", &accounts.allocated)
            .field("limit", &self.ledger.max_reservation)
            .field("released", &accounts.released)
            .finish()
    }
}

/// Non-owning reference to a [`Budget`].
#[derive(Clone)]
pub struct WeakBudget(Weak<Ledger>);

impl WeakBudget {
    pub fn upgrade(&self) -> Option<Budget> {
        self.0.upgrade().map(|ledger| Budget { ledger })
    }
}

impl fmt::Debug for WeakBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(ledger) => write!(f, "WeakBudget({})", ledger.name),
            None => f.write_str("WeakBudget(<dropped>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_api::QueryId;

    const MIB: u64 = 1024 * 1024;

    fn handle(minor: i32) -> FragmentHandle {
        FragmentHandle::new(QueryId::random(), 0, minor)
    }

    #[test]
    fn allocation_is_charged_until_dropped() {
        let root = Budget::root("root", MIB);
        let buffer = root.buffer(4096).unwrap();
        assert_eq!(buffer.len(), 4096);
        assert!(buffer.iter().all(|b| *b == 0));
        assert_eq!(root.allocated(), 4096);

        drop(buffer);
        assert_eq!(root.allocated(), 0);
        assert_eq!(root.peak(), 4096);
    }

    #[test]
    fn child_over_its_maximum_fails_without_side_effects() {
        let root = Budget::root("root", MIB);
        let child = root.child(&handle(0), 0, 100).unwrap();
        let held = child.buffer(60).unwrap();

        let err = child.buffer(200).unwrap_err();
        assert!(matches!(err, Error::OutOfBudget { requested: 200, limit: 100, .. }));
        assert_eq!(child.allocated(), 60);
        assert_eq!(root.allocated(), 60);
        drop(held);
    }

    #[test]
    fn child_charges_parent_its_initial_reservation() {
        let root = Budget::root("root", 1000);
        let child = root.child(&handle(0), 300, 800).unwrap();
        assert_eq!(root.allocated(), 300);
        assert_eq!(child.allocated(), 0);

        // Within the reservation the parent is not charged again.
        let small = child.buffer(200).unwrap();
        assert_eq!(root.allocated(), 300);

        // Past the reservation only the overflow reaches the parent.
        let large = child.buffer(400).unwrap();
        assert_eq!(child.allocated(), 600);
        assert_eq!(root.allocated(), 600);

        drop(large);
        assert_eq!(root.allocated(), 300);
        drop(small);
        assert_eq!(root.allocated(), 300);

        child.release().unwrap();
        assert_eq!(root.allocated(), 0);
    }

    #[test]
    fn parent_limit_bounds_children() {
        let root = Budget::root("root", 500);
        let child = root.child(&handle(0), 0, 1000).unwrap();
        let err = child.buffer(600).unwrap_err();
        assert!(matches!(err, Error::OutOfBudget { ref budget, .. } if budget == "root"));
        assert_eq!(child.allocated(), 0);
        assert_eq!(root.allocated(), 0);

        let err = root.child(&handle(1), 600, 700).unwrap_err();
        assert!(matches!(err, Error::OutOfBudget { .. }));
        let err = root.child(&handle(2), 10, 5).unwrap_err();
        assert!(matches!(err, Error::InvalidReservation { initial: 10, max: 5 }));
    }

    #[test]
    fn release_happens_once() {
        let root = Budget::root("root", MIB);
        let child = root.child(&handle(0), 0, MIB).unwrap();
        let outstanding = child.buffer(1024).unwrap();
        assert_eq!(root.allocated(), 1024);

        child.release().unwrap();
        assert!(child.is_released());
        assert_eq!(child.allocated(), 0);
        assert_eq!(root.allocated(), 0);
        assert!(matches!(child.release(), Err(Error::BudgetReleased(_))));
        assert!(matches!(child.buffer(1), Err(Error::BudgetReleased(_))));

        // Dropping a buffer after release does not touch the parent again.
        drop(outstanding);
        assert_eq!(root.allocated(), 0);
    }

    #[test]
    fn range_allocation_falls_back_to_minimum() {
        let root = Budget::root("root", 100);
        let wide = root.buffer_in_range(10, 80).unwrap();
        assert_eq!(wide.len(), 80);
        let narrow = root.buffer_in_range(10, 80).unwrap();
        assert_eq!(narrow.len(), 10);
        assert!(root.buffer_in_range(20, 80).is_err());
        assert!(root.buffer_in_range(5, 1).is_err());
    }

    #[test]
    fn pre_allocator_allocates_the_sum() {
        let root = Budget::root("root", MIB);
        let mut planner = root.pre_allocator().unwrap();
        planner.add_allocation(100);
        planner.add_allocation(28);
        assert_eq!(planner.planned_bytes(), 128);
        let buffer = planner.allocate().unwrap();
        assert_eq!(buffer.len(), 128);
        assert_eq!(root.allocated_bytes().unwrap(), 128);
    }

    #[test]
    fn child_names_follow_the_tree() {
        let root = Budget::root("worker", MIB);
        let h = handle(3);
        let child = root.child(&h, 0, MIB).unwrap();
        assert_eq!(child.name(), format!("worker/{}", h));
        assert_eq!(child.limit(), MIB);
    }

    #[test]
    fn dropped_child_returns_its_reservation() {
        let root = Budget::root("root", MIB);
        let child = root.child(&handle(0), 512, MIB).unwrap();
        let buffer = child.buffer(1024).unwrap();
        assert_eq!(root.allocated(), 1024);

        drop(child);
        // The buffer still holds the account open.
        assert_eq!(root.allocated(), 1024);
        drop(buffer);
        assert_eq!(root.allocated(), 0);
    }

    #[test]
    fn weak_budget_does_not_keep_the_budget_alive() {
        let root = Budget::root("root", MIB);
        let weak = root.downgrade();
        assert!(weak.upgrade().is_some());
        drop(root);
        assert!(weak.upgrade().is_none());
    }
}
