//! The durable shard row and its in-memory mirror.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::cluster::ClusterName;
use super::namespace::NamespaceId;
use super::task::TaskKey;
use super::time::ZERO_TIME;

/// Numeric identity of one shard. Immutable for the life of the row.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(i32);

impl ShardId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-category entry in the generic ack-level map: one global level
/// plus one level per cluster, both in the category's key encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAckLevel {
    pub ack_level: i64,
    pub cluster_ack_level: BTreeMap<ClusterName, i64>,
}

/// The durable shard row. One row per shard; a host proves ownership by
/// CAS-ing `range_id` forward.
///
/// Ack levels exist in two parallel representations kept in sync for
/// rollback compatibility: the legacy per-category scalar fields and
/// per-cluster maps, and the generic `queue_ack_levels` map keyed by
/// category id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub owner: String,
    pub range_id: i64,
    pub stolen_since_renew: i32,

    pub transfer_ack_level: i64,
    pub timer_ack_level: Option<SystemTime>,
    pub replication_ack_level: i64,
    pub visibility_ack_level: i64,

    pub cluster_transfer_ack_level: BTreeMap<ClusterName, i64>,
    pub cluster_timer_ack_level: BTreeMap<ClusterName, SystemTime>,
    pub cluster_replication_level: BTreeMap<ClusterName, i64>,
    pub replication_dlq_ack_level: BTreeMap<ClusterName, i64>,

    pub namespace_notification_version: i64,
    pub queue_ack_levels: BTreeMap<i32, QueueAckLevel>,
    pub update_time: Option<SystemTime>,
}

impl ShardInfo {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            owner: String::new(),
            range_id: 0,
            stolen_since_renew: 0,
            transfer_ack_level: 0,
            timer_ack_level: None,
            replication_ack_level: 0,
            visibility_ack_level: 0,
            cluster_transfer_ack_level: BTreeMap::new(),
            cluster_timer_ack_level: BTreeMap::new(),
            cluster_replication_level: BTreeMap::new(),
            replication_dlq_ack_level: BTreeMap::new(),
            namespace_notification_version: 0,
            queue_ack_levels: BTreeMap::new(),
            update_time: None,
        }
    }

    /// Deep copy taken before every persist, so a failed write leaves
    /// the in-memory view untouched. Absent timer timestamps are
    /// normalized to the zero-time sentinel.
    pub fn copy_for_update(&self) -> ShardInfo {
        let mut copy = self.clone();
        if copy.timer_ack_level.is_none() {
            copy.timer_ack_level = Some(ZERO_TIME);
        }
        copy
    }
}

/// Ack-level ceiling in effect while a namespace fails over between
/// clusters. In-memory only; never persisted in the shard row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverLevel {
    pub start_time: SystemTime,
    pub min_level: TaskKey,
    pub current_level: TaskKey,
    pub max_level: TaskKey,
    pub namespace_ids: BTreeSet<NamespaceId>,
}
