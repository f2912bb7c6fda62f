//! Replication DLQ handling: read, purge and merge dead-lettered
//! replication tasks, keeping the shard's DLQ ack level current.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::{ClusterName, Deadline, NamespaceId, RunId, Task, TaskKind};
use crate::persistence::{
    GetReplicationTasksFromDlqRequest, RangeDeleteReplicationTaskFromDlqRequest, StoreError,
};
use crate::shard::{Engine, ShardContext, ShardError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationTaskType {
    SyncActivity,
    History,
}

/// Skeleton of a dead-lettered task, sent to the source cluster to be
/// hydrated into a full replication task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationTaskInfo {
    pub namespace_id: NamespaceId,
    pub workflow_id: String,
    pub run_id: RunId,
    pub task_type: ReplicationTaskType,
    pub task_id: i64,
    pub version: i64,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub scheduled_event_id: i64,
}

impl ReplicationTaskInfo {
    fn from_task(task: &Task) -> Result<Self, StoreError> {
        let mut info = ReplicationTaskInfo {
            namespace_id: task.workflow.namespace_id,
            workflow_id: task.workflow.workflow_id.clone(),
            run_id: task.workflow.run_id,
            task_type: ReplicationTaskType::SyncActivity,
            task_id: task.task_id,
            version: task.version,
            first_event_id: 0,
            next_event_id: 0,
            scheduled_event_id: 0,
        };
        match task.kind {
            TaskKind::SyncActivity { scheduled_event_id } => {
                info.scheduled_event_id = scheduled_event_id;
            }
            TaskKind::HistoryReplication {
                first_event_id,
                next_event_id,
            } => {
                info.task_type = ReplicationTaskType::History;
                info.first_event_id = first_event_id;
                info.next_event_id = next_event_id;
            }
            ref other => {
                return Err(StoreError::InvalidRequest {
                    message: format!("unexpected task kind in replication DLQ: {other:?}"),
                });
            }
        }
        Ok(info)
    }
}

/// A replication task hydrated by the source cluster.
#[derive(Clone, Debug)]
pub struct ReplicationTask {
    pub source_task_id: i64,
    pub info: ReplicationTaskInfo,
    pub payload: Bytes,
}

/// Fetches hydrated replication tasks from a remote cluster's admin
/// surface.
pub trait DlqReplicationFetcher: Send + Sync {
    fn dlq_replication_tasks(
        &self,
        deadline: Deadline,
        source_cluster: &ClusterName,
        task_infos: &[ReplicationTaskInfo],
    ) -> Result<Vec<ReplicationTask>, StoreError>;
}

/// Applies a hydrated replication task locally.
pub trait ReplicationTaskExecutor: Send + Sync {
    fn execute(
        &self,
        deadline: Deadline,
        task: &ReplicationTask,
        force_apply: bool,
    ) -> Result<(), StoreError>;
}

/// Builds per-source-cluster executors. Receives the engine so executors
/// can re-apply events through it.
pub trait ReplicationTaskExecutorProvider: Send + Sync {
    fn create(
        &self,
        source_cluster: &ClusterName,
        engine: Arc<dyn Engine>,
    ) -> Arc<dyn ReplicationTaskExecutor>;
}

pub struct DlqHandler {
    shard: Arc<ShardContext>,
    fetcher: Arc<dyn DlqReplicationFetcher>,
    executor_provider: Arc<dyn ReplicationTaskExecutorProvider>,
    executors: Mutex<BTreeMap<ClusterName, Arc<dyn ReplicationTaskExecutor>>>,
}

impl DlqHandler {
    pub fn new(
        shard: Arc<ShardContext>,
        fetcher: Arc<dyn DlqReplicationFetcher>,
        executor_provider: Arc<dyn ReplicationTaskExecutorProvider>,
    ) -> Self {
        Self {
            shard,
            fetcher,
            executor_provider,
            executors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read dead-lettered tasks above the ack level, hydrated by the
    /// source cluster.
    pub fn get_messages(
        &self,
        deadline: Deadline,
        source_cluster: &ClusterName,
        last_message_id: i64,
        page_size: usize,
        page_token: Option<Bytes>,
    ) -> Result<(Vec<ReplicationTask>, Option<Bytes>), ShardError> {
        let (tasks, _ack_level, token) = self.read_messages_with_ack_level(
            deadline,
            source_cluster,
            last_message_id,
            page_size,
            page_token,
        )?;
        Ok((tasks, token))
    }

    /// Drop every dead-lettered task up to `last_message_id`, then
    /// advance the ack level. The ack update is best-effort: a failure
    /// is logged and does not fail the purge.
    pub fn purge_messages(
        &self,
        deadline: Deadline,
        source_cluster: &ClusterName,
        last_message_id: i64,
    ) -> Result<(), ShardError> {
        let ack_level = self.shard.replicator_dlq_ack_level(source_cluster)?;
        self.shard
            .execution_store()
            .range_delete_replication_task_from_dlq(
                deadline,
                &RangeDeleteReplicationTaskFromDlqRequest {
                    shard_id: self.shard.shard_id(),
                    source_cluster: source_cluster.clone(),
                    min_task_id: ack_level + 1,
                    max_task_id: last_message_id + 1,
                },
            )
            .map_err(ShardError::from)?;

        // A purge below the current ack level must leave it unchanged.
        if last_message_id > ack_level
            && let Err(err) = self
                .shard
                .update_replicator_dlq_ack_level(source_cluster, last_message_id)
        {
            tracing::error!(
                shard = %self.shard.shard_id(),
                %source_cluster,
                error = %err,
                "failed to advance replication DLQ ack level after purge"
            );
        }
        Ok(())
    }

    /// Re-apply dead-lettered tasks through the executor, then drop them
    /// and advance the ack level (best-effort, as for purge).
    pub fn merge_messages(
        &self,
        deadline: Deadline,
        source_cluster: &ClusterName,
        last_message_id: i64,
        page_size: usize,
        page_token: Option<Bytes>,
    ) -> Result<Option<Bytes>, ShardError> {
        let (tasks, ack_level, token) = self.read_messages_with_ack_level(
            deadline,
            source_cluster,
            last_message_id,
            page_size,
            page_token,
        )?;

        let executor = self.executor(source_cluster)?;
        for task in &tasks {
            executor
                .execute(deadline, task, true)
                .map_err(ShardError::from)?;
        }

        self.shard
            .execution_store()
            .range_delete_replication_task_from_dlq(
                deadline,
                &RangeDeleteReplicationTaskFromDlqRequest {
                    shard_id: self.shard.shard_id(),
                    source_cluster: source_cluster.clone(),
                    min_task_id: ack_level + 1,
                    max_task_id: last_message_id + 1,
                },
            )
            .map_err(ShardError::from)?;

        if last_message_id > ack_level
            && let Err(err) = self
                .shard
                .update_replicator_dlq_ack_level(source_cluster, last_message_id)
        {
            tracing::error!(
                shard = %self.shard.shard_id(),
                %source_cluster,
                error = %err,
                "failed to advance replication DLQ ack level after merge"
            );
        }
        Ok(token)
    }

    fn read_messages_with_ack_level(
        &self,
        deadline: Deadline,
        source_cluster: &ClusterName,
        last_message_id: i64,
        page_size: usize,
        page_token: Option<Bytes>,
    ) -> Result<(Vec<ReplicationTask>, i64, Option<Bytes>), ShardError> {
        let ack_level = self.shard.replicator_dlq_ack_level(source_cluster)?;
        let response = self
            .shard
            .execution_store()
            .get_replication_tasks_from_dlq(
                deadline,
                &GetReplicationTasksFromDlqRequest {
                    shard_id: self.shard.shard_id(),
                    source_cluster: source_cluster.clone(),
                    min_task_id: ack_level + 1,
                    max_task_id: last_message_id + 1,
                    batch_size: page_size,
                    next_page_token: page_token,
                },
            )
            .map_err(ShardError::from)?;

        let mut task_infos = Vec::with_capacity(response.tasks.len());
        for task in &response.tasks {
            task_infos.push(ReplicationTaskInfo::from_task(task).map_err(ShardError::from)?);
        }
        if task_infos.is_empty() {
            return Ok((Vec::new(), ack_level, response.next_page_token));
        }

        let tasks = self
            .fetcher
            .dlq_replication_tasks(deadline, source_cluster, &task_infos)
            .map_err(ShardError::from)?;
        Ok((tasks, ack_level, response.next_page_token))
    }

    fn executor(
        &self,
        source_cluster: &ClusterName,
    ) -> Result<Arc<dyn ReplicationTaskExecutor>, ShardError> {
        let mut executors = self.executors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(executor) = executors.get(source_cluster) {
            return Ok(Arc::clone(executor));
        }
        let engine = self.shard.engine(Deadline::none())?;
        let executor = self.executor_provider.create(source_cluster, engine);
        executors.insert(source_cluster.clone(), Arc::clone(&executor));
        Ok(executor)
    }
}
