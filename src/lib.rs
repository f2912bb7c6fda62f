#![forbid(unsafe_code)]

//! Per-shard coordination core of the weft workflow-history service.
//!
//! A fleet of hosts partitions workflows across a fixed number of
//! numeric shards; at any instant a single host owns each shard and
//! serializes all writes against it. [`shard::ShardContext`] is the
//! in-memory owner of one shard: it holds the exclusive range lease,
//! allocates monotonic task ids, tracks per-queue ack watermarks, and
//! brokers every workflow mutation through the persistence driver.

pub mod backoff;
pub mod config;
pub mod core;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod shard;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the domain types at the crate root for convenience.
pub use crate::core::{
    CancelToken, CategoryKind, ClockDecodeError, ClusterInfo, ClusterMetadata, ClusterName,
    Deadline, EMPTY_QUEUE_MESSAGE_ID, EMPTY_VERSION, FailoverLevel, Namespace, NamespaceId,
    NamespaceRegistry, QueueAckLevel, RegistryError, ReplicationState, RunId, ShardClock, ShardId,
    ShardInfo, SystemTimeSource, Task, TaskCategory, TaskKey, TaskKind, TasksByCategory,
    TimeSource, WorkflowKey, ZERO_TIME,
};
pub use crate::shard::{
    Engine, EngineFactory, HandoverInfo, RemoteClusterInfo, ShardContext, ShardError, ShardParams,
    ShardReplicationStatus, operation_possibly_succeeded,
};
