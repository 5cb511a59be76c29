//! Common crate
//!
//! Shared error handling, time source and logging setup for Floe.
//!
//! # Example
//! ```rust
//! use floe_common::Error;
//! let err = Error::internal("example error");
//! assert!(!err.is_ordering_defect());
//! ```

pub mod clock;
pub mod error;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
