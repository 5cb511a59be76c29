//! Coordinator crate
//!
//! Tracks the status and liveness of every dispatched fragment from the
//! reports workers stream back over the control channel.

pub mod config;
pub mod fragment;
pub mod monitor;
pub mod tracker;

pub use fragment::{made_progress, FragmentRecord, FragmentSnapshot};
pub use monitor::spawn_stall_monitor;
pub use tracker::{FragmentTracker, StateChange};
