//! Worker crate
//!
//! Owns the memory side of fragment execution on a worker: the budget tree,
//! the data connections that receive batches from remote fragments and the
//! fragment managers those connections are handed to.
//!
//! A connection can be accepted before its fragment starts. It then
//! allocates through an unbound [`AllocatorProxy`] and every buffer request
//! fails with [`floe_common::Error::UnboundAllocator`] until
//! [`FragmentManager::attach`] swaps in the fragment's [`Budget`].

pub mod bus;
pub mod config;
pub mod connection;
pub mod manager;
pub mod memory;
pub mod proxy;
pub mod reporter;
pub mod service;

pub use bus::WorkBus;
pub use connection::{DataChannel, DataConnection};
pub use manager::{FragmentContext, FragmentManager};
pub use memory::{Budget, Buffer, BufferAllocator, PreAllocator, SystemAllocator, WeakBudget};
pub use proxy::AllocatorProxy;
pub use reporter::{spawn_status_reporter, FragmentProgress};
pub use service::Worker;
