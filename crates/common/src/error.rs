use floe_api::FragmentHandle;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for Floe crates.
///
/// Classification:
/// - state-machine anomalies (stale or duplicate status reports) never reach
///   this type; they are absorbed and logged where they happen
/// - identity and ordering violations ([`Error::UnknownFragment`],
///   [`Error::UnboundAllocator`], ...) are returned to the immediate caller
/// - resource exhaustion is [`Error::OutOfBudget`]
#[derive(Debug, Error)]
pub enum Error {
    #[error("no fragment registered for handle {0}")]
    UnknownFragment(FragmentHandle),

    #[error("fragment {0} is already registered")]
    DuplicateFragment(FragmentHandle),

    #[error("malformed status update: {0}")]
    MalformedStatus(String),

    #[error("unknown fragment state value {0}")]
    InvalidState(i32),

    /// A buffer operation reached a data connection before its fragment
    /// manager attached.
    #[error("attempted to use an allocator proxy before a budget was bound")]
    UnboundAllocator,

    #[error("allocator proxy is already bound")]
    AllocatorAlreadyBound,

    /// The budget a proxy was bound to no longer exists.
    #[error("allocator proxy outlived its bound budget")]
    AllocatorDetached,

    #[error(
        "budget {budget} cannot allocate {requested} bytes ({allocated} of {limit} bytes in use)"
    )]
    OutOfBudget {
        budget: String,
        requested: u64,
        allocated: u64,
        limit: u64,
    },

    #[error("initial reservation {initial} exceeds maximum reservation {max}")]
    InvalidReservation { initial: u64, max: u64 },

    #[error("budget {0} has been released")]
    BudgetReleased(String),

    #[error("data connection {0} is closed")]
    ConnectionClosed(Uuid),

    #[error("data connection {0} is already attached to a fragment")]
    AlreadyAttached(Uuid),

    #[error("fragment {0} has terminated")]
    FragmentTerminated(FragmentHandle),

    #[error("failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("an internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal(msg: &str) -> Self {
        Error::Internal(msg.to_string())
    }

    /// True for errors that mean the control plane and data plane ran out of
    /// order, or a caller used an identity nobody registered.
    pub fn is_ordering_defect(&self) -> bool {
        matches!(
            self,
            Error::UnknownFragment(_)
                | Error::UnboundAllocator
                | Error::AllocatorAlreadyBound
                | Error::AllocatorDetached
                | Error::AlreadyAttached(_)
        )
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::UnknownFragment(_) => tonic::Status::not_found(message),
            Error::DuplicateFragment(_) => tonic::Status::already_exists(message),
            Error::MalformedStatus(_) | Error::InvalidState(_) => {
                tonic::Status::invalid_argument(message)
            }
            Error::OutOfBudget { .. } => tonic::Status::resource_exhausted(message),
            Error::UnboundAllocator
            | Error::AllocatorAlreadyBound
            | Error::AllocatorDetached
            | Error::AlreadyAttached(_)
            | Error::ConnectionClosed(_)
            | Error::BudgetReleased(_)
            | Error::FragmentTerminated(_) => tonic::Status::failed_precondition(message),
            Error::InvalidReservation { .. } | Error::Config(_) | Error::Internal(_) => {
                tonic::Status::internal(message)
            }
        }
    }
}
