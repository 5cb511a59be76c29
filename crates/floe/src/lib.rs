//! Floe unifies the fragment status tracker that runs on the coordinator
//! with the worker-side memory accounting for data exchange.

pub use floe_api as api;
pub use floe_common as common;
pub use floe_coordinator as coordinator;
pub use floe_worker as worker;

pub use floe_api::{FragmentHandle, FragmentState, FragmentStatus, NodeEndpoint, QueryId};
pub use floe_common::{Error, Result};
