//! Domain primitives shared across the shard runtime.

pub mod clock;
pub mod cluster;
pub mod namespace;
pub mod shard_info;
pub mod task;
pub mod time;

pub use clock::{ClockDecodeError, ShardClock};
pub use cluster::{ClusterInfo, ClusterMetadata, ClusterName};
pub use namespace::{Namespace, NamespaceId, NamespaceRegistry, RegistryError, ReplicationState, RunId};
pub use shard_info::{FailoverLevel, QueueAckLevel, ShardId, ShardInfo};
pub use task::{
    CategoryKind, EMPTY_QUEUE_MESSAGE_ID, EMPTY_VERSION, Task, TaskCategory, TaskKey, TaskKind,
    TasksByCategory, WorkflowKey,
};
pub use time::{
    CancelToken, Deadline, SystemTimeSource, TimeSource, ZERO_TIME, max_time, to_unix_nanos,
    truncate_to_ms, unix_or_zero_time,
};
