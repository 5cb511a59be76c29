//! API crate
//!
//! Message definitions exchanged over the control channel between workers and
//! the coordinator. The types are plain `prost` messages so they can be framed
//! by whichever transport carries them.

pub mod floe {
    use std::fmt;
    use uuid::Uuid;

    /// Identity of one query, stored as the two halves of a UUID.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct QueryId {
        #[prost(sfixed64, tag = "1")]
        pub part1: i64,
        #[prost(sfixed64, tag = "2")]
        pub part2: i64,
    }

    /// Identity of a single fragment instance within a query.
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct FragmentHandle {
        #[prost(message, optional, tag = "1")]
        pub query_id: ::core::option::Option<QueryId>,
        #[prost(int32, tag = "2")]
        pub major_fragment_id: i32,
        #[prost(int32, tag = "3")]
        pub minor_fragment_id: i32,
    }

    /// A worker node as seen by the rest of the cluster.
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct NodeEndpoint {
        #[prost(string, tag = "1")]
        pub address: ::prost::alloc::string::String,
        #[prost(uint32, tag = "2")]
        pub control_port: u32,
        #[prost(uint32, tag = "3")]
        pub data_port: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricValue {
        #[prost(int32, tag = "1")]
        pub metric_id: i32,
        #[prost(int64, tag = "2")]
        pub long_value: i64,
        #[prost(double, optional, tag = "3")]
        pub double_value: ::core::option::Option<f64>,
    }

    /// Per-input counters of an operator.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StreamProfile {
        #[prost(int64, tag = "1")]
        pub records: i64,
        #[prost(int64, tag = "2")]
        pub batches: i64,
        #[prost(int64, tag = "3")]
        pub schemas: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OperatorProfile {
        #[prost(message, repeated, tag = "1")]
        pub input_profile: ::prost::alloc::vec::Vec<StreamProfile>,
        #[prost(int32, tag = "3")]
        pub operator_id: i32,
        #[prost(int32, tag = "4")]
        pub operator_type: i32,
        #[prost(int64, tag = "5")]
        pub setup_nanos: i64,
        #[prost(int64, tag = "6")]
        pub process_nanos: i64,
        #[prost(int64, tag = "7")]
        pub peak_local_memory_allocated: i64,
        #[prost(message, repeated, tag = "8")]
        pub metric: ::prost::alloc::vec::Vec<MetricValue>,
        #[prost(int64, tag = "9")]
        pub wait_nanos: i64,
    }

    /// Execution profile of one minor fragment.
    ///
    /// `last_update` and `last_progress` are epoch milliseconds and are only
    /// filled in by the coordinator when a snapshot is taken.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MinorFragmentProfile {
        #[prost(enumeration = "FragmentState", tag = "1")]
        pub state: i32,
        #[prost(string, tag = "2")]
        pub error: ::prost::alloc::string::String,
        #[prost(int32, tag = "3")]
        pub minor_fragment_id: i32,
        #[prost(message, repeated, tag = "4")]
        pub operator_profile: ::prost::alloc::vec::Vec<OperatorProfile>,
        #[prost(int64, tag = "5")]
        pub start_time: i64,
        #[prost(int64, tag = "6")]
        pub end_time: i64,
        #[prost(int64, tag = "7")]
        pub memory_used: i64,
        #[prost(int64, tag = "8")]
        pub max_memory_used: i64,
        #[prost(message, optional, tag = "9")]
        pub endpoint: ::core::option::Option<NodeEndpoint>,
        #[prost(int64, tag = "10")]
        pub last_update: i64,
        #[prost(int64, tag = "11")]
        pub last_progress: i64,
    }

    /// Status update for one fragment, sent by workers to the coordinator.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FragmentStatus {
        #[prost(message, optional, tag = "1")]
        pub profile: ::core::option::Option<MinorFragmentProfile>,
        #[prost(message, optional, tag = "2")]
        pub handle: ::core::option::Option<FragmentHandle>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum FragmentState {
        Sending = 0,
        AwaitingAllocation = 1,
        Running = 2,
        Finished = 3,
        Cancelled = 4,
        Failed = 5,
    }

    impl FragmentState {
        pub fn as_str_name(&self) -> &'static str {
            match self {
                FragmentState::Sending => "SENDING",
                FragmentState::AwaitingAllocation => "AWAITING_ALLOCATION",
                FragmentState::Running => "RUNNING",
                FragmentState::Finished => "FINISHED",
                FragmentState::Cancelled => "CANCELLED",
                FragmentState::Failed => "FAILED",
            }
        }

        /// Terminal states accept no further transitions.
        pub fn is_terminal(&self) -> bool {
            matches!(
                self,
                FragmentState::Finished | FragmentState::Failed | FragmentState::Cancelled
            )
        }
    }

    impl fmt::Display for FragmentState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str_name())
        }
    }

    impl QueryId {
        pub fn random() -> Self {
            Self::from_uuid(Uuid::new_v4())
        }

        pub fn from_uuid(id: Uuid) -> Self {
            let (high, low) = id.as_u64_pair();
            Self {
                part1: high as i64,
                part2: low as i64,
            }
        }

        pub fn as_uuid(&self) -> Uuid {
            Uuid::from_u64_pair(self.part1 as u64, self.part2 as u64)
        }
    }

    impl fmt::Display for QueryId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.as_uuid())
        }
    }

    impl FragmentHandle {
        pub fn new(query_id: QueryId, major_fragment_id: i32, minor_fragment_id: i32) -> Self {
            Self {
                query_id: Some(query_id),
                major_fragment_id,
                minor_fragment_id,
            }
        }

        pub fn query(&self) -> Option<QueryId> {
            self.query_id
        }
    }

    /// Renders as `<query>:<major>:<minor>`.
    impl fmt::Display for FragmentHandle {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match &self.query_id {
                Some(query_id) => write!(
                    f,
                    "{}:{}:{}",
                    query_id, self.major_fragment_id, self.minor_fragment_id
                ),
                None => write!(
                    f,
                    "unknown:{}:{}",
                    self.major_fragment_id, self.minor_fragment_id
                ),
            }
        }
    }

    impl NodeEndpoint {
        pub fn new(address: impl Into<String>, control_port: u32, data_port: u32) -> Self {
            Self {
                address: address.into(),
                control_port,
                data_port,
            }
        }
    }

    impl fmt::Display for NodeEndpoint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}", self.address, self.data_port)
        }
    }
}

pub use floe::{
    FragmentHandle, FragmentState, FragmentStatus, MetricValue, MinorFragmentProfile,
    NodeEndpoint, OperatorProfile, QueryId, StreamProfile,
};
