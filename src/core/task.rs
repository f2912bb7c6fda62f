//! Task categories, keys and the task records carried by mutations.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::namespace::{NamespaceId, RunId};
use super::time::{ZERO_TIME, to_unix_nanos, unix_or_zero_time};

/// Version value meaning "no failover version set" on a task.
pub const EMPTY_VERSION: i64 = 0;

/// Sentinel id for an empty replication queue.
pub const EMPTY_QUEUE_MESSAGE_ID: i64 = -1;

/// How a queue orders its tasks: by monotonic int id or by wall-clock
/// fire time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryKind {
    Immediate,
    Scheduled,
}

/// The task queues the shard allocates ids for and tracks watermarks of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskCategory {
    Transfer,
    Timer,
    Replication,
    Visibility,
}

impl TaskCategory {
    /// Numeric id used to key the durable `queue_ack_levels` map.
    pub fn id(self) -> i32 {
        match self {
            TaskCategory::Transfer => 1,
            TaskCategory::Timer => 2,
            TaskCategory::Replication => 3,
            TaskCategory::Visibility => 4,
        }
    }

    pub fn kind(self) -> CategoryKind {
        match self {
            TaskCategory::Timer => CategoryKind::Scheduled,
            _ => CategoryKind::Immediate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskCategory::Transfer => "transfer",
            TaskCategory::Timer => "timer",
            TaskCategory::Replication => "replication",
            TaskCategory::Visibility => "visibility",
        }
    }

    pub fn categories() -> [TaskCategory; 4] {
        [
            TaskCategory::Transfer,
            TaskCategory::Timer,
            TaskCategory::Replication,
            TaskCategory::Visibility,
        ]
    }

    pub fn from_id(id: i32) -> Option<TaskCategory> {
        Self::categories().into_iter().find(|c| c.id() == id)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a task within its queue. Immediate categories order by
/// `task_id` alone; scheduled categories order by `fire_time` first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub fire_time: SystemTime,
    pub task_id: i64,
}

impl TaskKey {
    pub const fn zero() -> Self {
        Self {
            fire_time: ZERO_TIME,
            task_id: 0,
        }
    }

    pub fn immediate(task_id: i64) -> Self {
        Self {
            fire_time: ZERO_TIME,
            task_id,
        }
    }

    pub fn scheduled(fire_time: SystemTime) -> Self {
        Self {
            fire_time,
            task_id: 0,
        }
    }

    /// Persisted ack-level encoding: raw task id for immediate
    /// categories, unix nanoseconds for scheduled ones.
    pub fn to_ack_level(self, kind: CategoryKind) -> i64 {
        match kind {
            CategoryKind::Immediate => self.task_id,
            CategoryKind::Scheduled => to_unix_nanos(self.fire_time),
        }
    }

    pub fn from_ack_level(kind: CategoryKind, level: i64) -> Self {
        match kind {
            CategoryKind::Immediate => TaskKey::immediate(level),
            CategoryKind::Scheduled => TaskKey::scheduled(unix_or_zero_time(level)),
        }
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::zero()
    }
}

/// Identity of one workflow execution.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

impl WorkflowKey {
    pub fn new(namespace_id: NamespaceId, workflow_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

/// The task variants the shard core inspects. Everything else rides
/// through opaque to the queue processors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    WorkflowTask,
    CloseExecution,
    StartExecutionVisibility,
    UpsertExecutionVisibility,
    CloseExecutionVisibility,
    DeleteExecutionVisibility {
        start_time: Option<SystemTime>,
        close_time: Option<SystemTime>,
    },
    UserTimer,
    WorkflowRunTimeout,
    SyncActivity {
        scheduled_event_id: i64,
    },
    HistoryReplication {
        first_event_id: i64,
        next_event_id: i64,
    },
}

/// A queue task attached to a workflow mutation. `task_id` is zero until
/// the shard assigns one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub workflow: WorkflowKey,
    pub kind: TaskKind,
    pub task_id: i64,
    pub visibility_time: SystemTime,
    pub version: i64,
}

impl Task {
    pub fn new(workflow: WorkflowKey, kind: TaskKind, visibility_time: SystemTime, version: i64) -> Self {
        Self {
            workflow,
            kind,
            task_id: 0,
            visibility_time,
            version,
        }
    }

    pub fn key(&self, kind: CategoryKind) -> TaskKey {
        match kind {
            CategoryKind::Immediate => TaskKey::immediate(self.task_id),
            CategoryKind::Scheduled => TaskKey {
                fire_time: self.visibility_time,
                task_id: self.task_id,
            },
        }
    }
}

/// Tasks grouped by destination queue, as carried by mutation requests.
pub type TasksByCategory = BTreeMap<TaskCategory, Vec<Task>>;
