//! Persistence-driver contract: the operations the shard context brokers
//! and the error taxonomy its write pipeline classifies.
//!
//! The concrete driver lives outside this crate. Everything here is a
//! blocking call; drivers honor the passed [`Deadline`] as an I/O
//! timeout.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    CancelToken, ClusterName, Deadline, NamespaceId, RunId, ShardId, ShardInfo, Task,
    TasksByCategory,
};
use crate::error::{Effect, Transience};

/// Errors surfaced by the persistence driver.
///
/// The variants matter more than the messages: the write pipeline
/// decides between "definitely not committed", "shard stolen" and
/// "outcome unknown" purely from the variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("current workflow record condition failed: {message}")]
    CurrentWorkflowConditionFailed { message: String },

    #[error("workflow mutable state condition failed: {message}")]
    WorkflowConditionFailed { message: String },

    #[error("condition failed: {message}")]
    ConditionFailed { message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("shard ownership lost to {new_owner}")]
    ShardOwnershipLost { new_owner: String },

    #[error("record not found")]
    NotFound,

    #[error("namespace not found")]
    NamespaceNotFound,

    #[error("invalid persistence request: {message}")]
    InvalidRequest { message: String },

    #[error("transaction size limit exceeded: {message}")]
    TransactionSizeLimit { message: String },

    #[error("persistence operation timed out: {message}")]
    Timeout { message: String },

    #[error("persistence unavailable: {message}")]
    Unavailable { message: String },

    #[error("persistence internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Whether retrying this operation may succeed.
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Unavailable { .. }
            | StoreError::Timeout { .. }
            | StoreError::ResourceExhausted { .. } => Transience::Retryable,
            StoreError::Internal { .. } => Transience::Unknown,
            StoreError::CurrentWorkflowConditionFailed { .. }
            | StoreError::WorkflowConditionFailed { .. }
            | StoreError::ConditionFailed { .. }
            | StoreError::ShardOwnershipLost { .. }
            | StoreError::NotFound
            | StoreError::NamespaceNotFound
            | StoreError::InvalidRequest { .. }
            | StoreError::TransactionSizeLimit { .. } => Transience::Permanent,
        }
    }

    /// What we know about side effects when this error is returned.
    pub fn effect(&self) -> Effect {
        if self.possibly_succeeded() {
            Effect::Unknown
        } else {
            Effect::None
        }
    }

    /// False when the write definitely did not commit. Anything we
    /// cannot prove failed counts as possibly succeeded, and downstream
    /// side effects (engine notifications) must still fire.
    pub fn possibly_succeeded(&self) -> bool {
        !matches!(
            self,
            StoreError::CurrentWorkflowConditionFailed { .. }
                | StoreError::WorkflowConditionFailed { .. }
                | StoreError::ConditionFailed { .. }
                | StoreError::ShardOwnershipLost { .. }
                | StoreError::InvalidRequest { .. }
                | StoreError::TransactionSizeLimit { .. }
                | StoreError::ResourceExhausted { .. }
                | StoreError::NotFound
                | StoreError::NamespaceNotFound
        )
    }
}

/// Execution metadata the shard core reads and stamps. The full mutable
/// state carries much more; only the fields the core touches appear
/// here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub close_transfer_task_id: i64,
    pub close_visibility_task_id: i64,
}

impl ExecutionInfo {
    pub fn new(namespace_id: NamespaceId, workflow_id: impl Into<String>) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            close_transfer_task_id: 0,
            close_visibility_task_id: 0,
        }
    }
}

/// Full-state image of one workflow run plus the queue tasks the write
/// produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: ExecutionInfo,
    pub run_id: RunId,
    pub tasks: TasksByCategory,
}

/// Delta applied to an existing run plus the queue tasks the write
/// produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMutation {
    pub execution_info: ExecutionInfo,
    pub run_id: RunId,
    pub tasks: TasksByCategory,
}

#[derive(Clone, Debug)]
pub struct CreateWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub new_snapshot: WorkflowSnapshot,
}

#[derive(Clone, Debug)]
pub struct UpdateWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub mutation: WorkflowMutation,
    pub new_snapshot: Option<WorkflowSnapshot>,
}

#[derive(Clone, Debug)]
pub struct ConflictResolveWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub reset_snapshot: WorkflowSnapshot,
    pub current_mutation: Option<WorkflowMutation>,
    pub new_snapshot: Option<WorkflowSnapshot>,
}

#[derive(Clone, Debug)]
pub struct SetWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub snapshot: WorkflowSnapshot,
}

#[derive(Clone, Debug)]
pub struct GetWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

#[derive(Clone, Debug)]
pub struct GetWorkflowExecutionResponse {
    pub state: WorkflowSnapshot,
}

#[derive(Clone, Debug)]
pub struct GetCurrentExecutionRequest {
    pub shard_id: ShardId,
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
}

#[derive(Clone, Debug)]
pub struct GetCurrentExecutionResponse {
    pub run_id: RunId,
}

#[derive(Clone, Debug)]
pub struct AddHistoryTasksRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
    pub tasks: TasksByCategory,
}

#[derive(Clone, Debug)]
pub struct AppendHistoryNodesRequest {
    pub shard_id: ShardId,
    pub branch_token: Bytes,
    pub events: Bytes,
}

#[derive(Clone, Debug)]
pub struct AppendHistoryNodesResponse {
    /// Encoded size of the appended nodes, for history-size accounting.
    pub size: usize,
}

#[derive(Clone, Debug)]
pub struct DeleteCurrentWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

#[derive(Clone, Debug)]
pub struct DeleteWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
}

#[derive(Clone, Debug)]
pub struct DeleteHistoryBranchRequest {
    pub shard_id: ShardId,
    pub branch_token: Bytes,
}

#[derive(Clone, Debug)]
pub struct GetReplicationTasksFromDlqRequest {
    pub shard_id: ShardId,
    pub source_cluster: ClusterName,
    /// Inclusive lower bound task id.
    pub min_task_id: i64,
    /// Exclusive upper bound task id.
    pub max_task_id: i64,
    pub batch_size: usize,
    pub next_page_token: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct GetReplicationTasksFromDlqResponse {
    pub tasks: Vec<Task>,
    pub next_page_token: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct RangeDeleteReplicationTaskFromDlqRequest {
    pub shard_id: ShardId,
    pub source_cluster: ClusterName,
    /// Inclusive lower bound task id.
    pub min_task_id: i64,
    /// Exclusive upper bound task id.
    pub max_task_id: i64,
}

/// Driver operations against the durable shard row.
pub trait ShardStore: Send + Sync {
    /// Load the row, creating it on first contact. Honors the lifecycle
    /// token so an in-flight load aborts at shard stop.
    fn get_or_create_shard(
        &self,
        deadline: Deadline,
        shard_id: ShardId,
        lifecycle: &CancelToken,
    ) -> Result<ShardInfo, StoreError>;

    /// CAS the row forward: succeeds only if the stored range id still
    /// equals `previous_range_id`.
    fn update_shard(
        &self,
        deadline: Deadline,
        info: &ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), StoreError>;

    fn assert_shard_ownership(
        &self,
        deadline: Deadline,
        shard_id: ShardId,
        range_id: i64,
    ) -> Result<(), StoreError>;
}

/// Driver operations against workflow executions, history and the
/// replication DLQ. Every mutation is conditioned on the request's
/// range id.
pub trait ExecutionStore: Send + Sync {
    fn create_workflow_execution(
        &self,
        deadline: Deadline,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn update_workflow_execution(
        &self,
        deadline: Deadline,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn conflict_resolve_workflow_execution(
        &self,
        deadline: Deadline,
        request: &ConflictResolveWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn set_workflow_execution(
        &self,
        deadline: Deadline,
        request: &SetWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn get_workflow_execution(
        &self,
        deadline: Deadline,
        request: &GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, StoreError>;

    fn get_current_execution(
        &self,
        deadline: Deadline,
        request: &GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, StoreError>;

    fn add_history_tasks(
        &self,
        deadline: Deadline,
        request: &AddHistoryTasksRequest,
    ) -> Result<(), StoreError>;

    fn append_history_nodes(
        &self,
        deadline: Deadline,
        request: &AppendHistoryNodesRequest,
    ) -> Result<AppendHistoryNodesResponse, StoreError>;

    fn delete_current_workflow_execution(
        &self,
        deadline: Deadline,
        request: &DeleteCurrentWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn delete_workflow_execution(
        &self,
        deadline: Deadline,
        request: &DeleteWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    fn delete_history_branch(
        &self,
        deadline: Deadline,
        request: &DeleteHistoryBranchRequest,
    ) -> Result<(), StoreError>;

    fn get_replication_tasks_from_dlq(
        &self,
        deadline: Deadline,
        request: &GetReplicationTasksFromDlqRequest,
    ) -> Result<GetReplicationTasksFromDlqResponse, StoreError>;

    fn range_delete_replication_task_from_dlq(
        &self,
        deadline: Deadline,
        request: &RangeDeleteReplicationTaskFromDlqRequest,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definite_failures_are_not_possibly_succeeded() {
        let definite = [
            StoreError::CurrentWorkflowConditionFailed {
                message: "x".into(),
            },
            StoreError::WorkflowConditionFailed { message: "x".into() },
            StoreError::ConditionFailed { message: "x".into() },
            StoreError::ResourceExhausted { message: "x".into() },
            StoreError::ShardOwnershipLost {
                new_owner: "other".into(),
            },
            StoreError::NotFound,
            StoreError::NamespaceNotFound,
            StoreError::InvalidRequest { message: "x".into() },
            StoreError::TransactionSizeLimit { message: "x".into() },
        ];
        for err in definite {
            assert!(!err.possibly_succeeded(), "{err}");
            assert_eq!(err.effect(), Effect::None, "{err}");
        }
    }

    #[test]
    fn unknown_outcomes_are_possibly_succeeded() {
        let unknown = [
            StoreError::Timeout { message: "x".into() },
            StoreError::Unavailable { message: "x".into() },
            StoreError::Internal { message: "x".into() },
        ];
        for err in unknown {
            assert!(err.possibly_succeeded(), "{err}");
            assert_eq!(err.effect(), Effect::Unknown, "{err}");
        }
    }

    #[test]
    fn transient_predicate_matches_retry_policy() {
        assert!(
            StoreError::Unavailable { message: "x".into() }
                .transience()
                .is_retryable()
        );
        assert!(
            StoreError::Timeout { message: "x".into() }
                .transience()
                .is_retryable()
        );
        assert!(
            StoreError::ResourceExhausted { message: "x".into() }
                .transience()
                .is_retryable()
        );
        assert!(
            !StoreError::ShardOwnershipLost {
                new_owner: "other".into()
            }
            .transience()
            .is_retryable()
        );
        assert!(!StoreError::NotFound.transience().is_retryable());
    }
}
