//! Workflow-mutation write pipeline and the deletion pipeline.
//!
//! Every mutation follows the same shape: floor the caller's deadline,
//! resolve the namespace outside the guard, take the write guard,
//! fail fast on state, allocate task ids, stamp the range lease, call
//! the driver, classify the result, and notify the engine after the
//! guard drops if the write possibly succeeded.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::backoff;
use crate::core::{
    CategoryKind, Deadline, EMPTY_VERSION, Namespace, RegistryError, Task, TaskCategory, TaskKind,
    TasksByCategory, WorkflowKey, ZERO_TIME,
};
use crate::metrics;
use crate::persistence::{
    AddHistoryTasksRequest, AppendHistoryNodesRequest, ConflictResolveWorkflowExecutionRequest,
    CreateWorkflowExecutionRequest, DeleteCurrentWorkflowExecutionRequest,
    DeleteHistoryBranchRequest, DeleteWorkflowExecutionRequest, ExecutionInfo,
    GetCurrentExecutionRequest, GetCurrentExecutionResponse, GetWorkflowExecutionRequest,
    GetWorkflowExecutionResponse, SetWorkflowExecutionRequest, StoreError,
    UpdateWorkflowExecutionRequest,
};

use super::context::{Inner, ShardContext};
use super::{ShardError, operation_possibly_succeeded};

impl ShardContext {
    pub fn add_tasks(
        &self,
        deadline: Deadline,
        mut request: AddHistoryTasksRequest,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;

        // Namespace lookup stays outside the shard guard.
        let namespace = self.registry.namespace_by_id(&request.namespace_id)?;
        let engine = self.engine(deadline)?;

        let mut inner = self.write();
        inner.check_state()?;
        let result = self.add_tasks_locked(&mut inner, deadline, &mut request, &namespace);
        drop(inner);

        if operation_possibly_succeeded(&result) {
            engine.notify_new_tasks(&namespace.active_cluster, &request.tasks);
        }
        result
    }

    pub fn create_workflow_execution(
        &self,
        deadline: Deadline,
        mut request: CreateWorkflowExecutionRequest,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;
        let namespace = self
            .registry
            .namespace_by_id(&request.new_snapshot.execution_info.namespace_id)?;

        let mut inner = self.write();
        inner.check_state()?;

        let mut transfer_max_read_level = 0;
        let workflow_id = request.new_snapshot.execution_info.workflow_id.clone();
        self.allocate_task_ids_locked(
            &mut inner,
            &namespace,
            &workflow_id,
            &mut request.new_snapshot.tasks,
            &mut transfer_max_read_level,
        )?;

        request.range_id = inner.info()?.range_id;
        let result = self.execution_store.create_workflow_execution(deadline, &request);
        self.handle_write_result_locked(&mut inner, result, transfer_max_read_level)
    }

    pub fn update_workflow_execution(
        &self,
        deadline: Deadline,
        mut request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;
        let namespace = self
            .registry
            .namespace_by_id(&request.mutation.execution_info.namespace_id)?;

        let mut inner = self.write();
        inner.check_state()?;

        let mut transfer_max_read_level = 0;
        let workflow_id = request.mutation.execution_info.workflow_id.clone();
        self.allocate_task_ids_locked(
            &mut inner,
            &namespace,
            &workflow_id,
            &mut request.mutation.tasks,
            &mut transfer_max_read_level,
        )?;
        update_close_task_ids(&mut request.mutation.execution_info, &request.mutation.tasks);
        if let Some(snapshot) = request.new_snapshot.as_mut() {
            self.allocate_task_ids_locked(
                &mut inner,
                &namespace,
                &workflow_id,
                &mut snapshot.tasks,
                &mut transfer_max_read_level,
            )?;
            update_close_task_ids(&mut snapshot.execution_info, &snapshot.tasks);
        }

        request.range_id = inner.info()?.range_id;
        let result = self.execution_store.update_workflow_execution(deadline, &request);
        self.handle_write_result_locked(&mut inner, result, transfer_max_read_level)
    }

    pub fn conflict_resolve_workflow_execution(
        &self,
        deadline: Deadline,
        mut request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;
        let namespace = self
            .registry
            .namespace_by_id(&request.reset_snapshot.execution_info.namespace_id)?;

        let mut inner = self.write();
        inner.check_state()?;

        let mut transfer_max_read_level = 0;
        let workflow_id = request.reset_snapshot.execution_info.workflow_id.clone();
        if let Some(mutation) = request.current_mutation.as_mut() {
            self.allocate_task_ids_locked(
                &mut inner,
                &namespace,
                &workflow_id,
                &mut mutation.tasks,
                &mut transfer_max_read_level,
            )?;
        }
        self.allocate_task_ids_locked(
            &mut inner,
            &namespace,
            &workflow_id,
            &mut request.reset_snapshot.tasks,
            &mut transfer_max_read_level,
        )?;
        if let Some(snapshot) = request.new_snapshot.as_mut() {
            self.allocate_task_ids_locked(
                &mut inner,
                &namespace,
                &workflow_id,
                &mut snapshot.tasks,
                &mut transfer_max_read_level,
            )?;
        }

        request.range_id = inner.info()?.range_id;
        let result = self
            .execution_store
            .conflict_resolve_workflow_execution(deadline, &request);
        self.handle_write_result_locked(&mut inner, result, transfer_max_read_level)
    }

    pub fn set_workflow_execution(
        &self,
        deadline: Deadline,
        mut request: SetWorkflowExecutionRequest,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;
        let namespace = self
            .registry
            .namespace_by_id(&request.snapshot.execution_info.namespace_id)?;

        let mut inner = self.write();
        inner.check_state()?;

        let mut transfer_max_read_level = 0;
        let workflow_id = request.snapshot.execution_info.workflow_id.clone();
        self.allocate_task_ids_locked(
            &mut inner,
            &namespace,
            &workflow_id,
            &mut request.snapshot.tasks,
            &mut transfer_max_read_level,
        )?;

        request.range_id = inner.info()?.range_id;
        let result = self.execution_store.set_workflow_execution(deadline, &request);
        self.handle_write_result_locked(&mut inner, result, transfer_max_read_level)
    }

    pub fn get_workflow_execution(
        &self,
        deadline: Deadline,
        request: &GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, ShardError> {
        self.read().check_state()?;
        self.execution_store
            .get_workflow_execution(deadline, request)
            .map_err(|err| self.handle_read_error(err))
    }

    pub fn get_current_execution(
        &self,
        deadline: Deadline,
        request: &GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, ShardError> {
        self.read().check_state()?;
        self.execution_store
            .get_current_execution(deadline, request)
            .map_err(|err| self.handle_read_error(err))
    }

    /// Append encoded history nodes, returning their encoded size.
    pub fn append_history_events(
        &self,
        deadline: Deadline,
        mut request: AppendHistoryNodesRequest,
        workflow: &WorkflowKey,
    ) -> Result<usize, ShardError> {
        self.read().check_state()?;

        request.shard_id = self.shard_id;
        let result = self.execution_store.append_history_nodes(deadline, &request);

        let size = result.as_ref().map(|resp| resp.size).unwrap_or(0);
        metrics::history_size(size as u64);
        if size as u64 >= self.config.history_size_warn_bytes {
            tracing::warn!(
                namespace = %workflow.namespace_id,
                workflow_id = %workflow.workflow_id,
                run_id = %workflow.run_id,
                size,
                "history size threshold breached"
            );
        }

        result.map(|resp| resp.size).map_err(ShardError::from)
    }

    /// Tear down one workflow execution.
    ///
    /// Four ordered steps, each idempotent; callers retry the whole
    /// operation on failure:
    /// 1. Schedule the visibility-record delete (skipped when the
    ///    namespace itself is being deleted).
    /// 2. Delete the current-execution pointer.
    /// 3. Delete the mutable state. Past this point the operation is no
    ///    longer retriable by the caller.
    /// 4. Delete the history branch, best-effort: an orphaned branch is
    ///    unreachable once the mutable state is gone and an external GC
    ///    workflow collects it.
    ///
    /// Step 4 must not run earlier: a visible execution without history
    /// would be an inconsistent state.
    pub fn delete_workflow_execution(
        &self,
        deadline: Deadline,
        key: WorkflowKey,
        branch_token: Option<Bytes>,
        new_task_version: i64,
        start_time: Option<SystemTime>,
        close_time: Option<SystemTime>,
    ) -> Result<(), ShardError> {
        let deadline = self.ensure_min_timeout(deadline)?;
        let engine = self.engine(deadline)?;

        // Namespace lookup outside the shard guard. Not-found means the
        // namespace is mid-deletion: skip the visibility record delete
        // but proceed with the rest.
        let namespace = match self.registry.namespace_by_id(&key.namespace_id) {
            Ok(namespace) => Some(namespace),
            Err(RegistryError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        let mut new_tasks: Option<TasksByCategory> = None;
        let result = self.delete_workflow_execution_steps(
            deadline,
            &key,
            branch_token,
            new_task_version,
            start_time,
            close_time,
            namespace.as_deref(),
            &mut new_tasks,
        );

        if operation_possibly_succeeded(&result)
            && let (Some(tasks), Some(namespace)) = (&new_tasks, &namespace)
        {
            engine.notify_new_tasks(&namespace.active_cluster, tasks);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn delete_workflow_execution_steps(
        &self,
        deadline: Deadline,
        key: &WorkflowKey,
        branch_token: Option<Bytes>,
        new_task_version: i64,
        start_time: Option<SystemTime>,
        close_time: Option<SystemTime>,
        namespace: Option<&Namespace>,
        new_tasks: &mut Option<TasksByCategory>,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        // Step 1. Schedule visibility record delete.
        if let Some(namespace) = namespace {
            let task = Task::new(
                key.clone(),
                TaskKind::DeleteExecutionVisibility {
                    start_time,
                    close_time,
                },
                self.time_source.now(),
                new_task_version,
            );
            let mut tasks = TasksByCategory::new();
            tasks.insert(TaskCategory::Visibility, vec![task]);
            let mut request = AddHistoryTasksRequest {
                shard_id: self.shard_id,
                range_id: 0,
                namespace_id: key.namespace_id,
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id,
                tasks,
            };
            self.add_tasks_locked(&mut inner, deadline, &mut request, namespace)?;
            *new_tasks = Some(request.tasks);
        }

        let policy = self.config.persistence_retry_policy();
        let transient = |err: &StoreError| err.transience().is_retryable();

        // Step 2. Delete the current-execution pointer.
        let delete_current = DeleteCurrentWorkflowExecutionRequest {
            shard_id: self.shard_id,
            namespace_id: key.namespace_id,
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id,
        };
        backoff::retry(policy, &self.lifecycle, transient, || {
            self.execution_store
                .delete_current_workflow_execution(deadline, &delete_current)
        })?;

        // Step 3. Delete the mutable state.
        let delete_state = DeleteWorkflowExecutionRequest {
            shard_id: self.shard_id,
            namespace_id: key.namespace_id,
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id,
        };
        backoff::retry(policy, &self.lifecycle, transient, || {
            self.execution_store
                .delete_workflow_execution(deadline, &delete_state)
        })?;

        // Step 4. Delete the history branch.
        if let Some(branch_token) = branch_token {
            let delete_branch = DeleteHistoryBranchRequest {
                shard_id: self.shard_id,
                branch_token,
            };
            backoff::retry(policy, &self.lifecycle, transient, || {
                self.execution_store
                    .delete_history_branch(deadline, &delete_branch)
            })?;
        }

        Ok(())
    }

    pub(super) fn add_tasks_locked(
        &self,
        inner: &mut Inner,
        deadline: Deadline,
        request: &mut AddHistoryTasksRequest,
        namespace: &Namespace,
    ) -> Result<(), ShardError> {
        let mut transfer_max_read_level = 0;
        let workflow_id = request.workflow_id.clone();
        self.allocate_task_ids_locked(
            inner,
            namespace,
            &workflow_id,
            &mut request.tasks,
            &mut transfer_max_read_level,
        )?;

        request.range_id = inner.info()?.range_id;
        let result = self.execution_store.add_history_tasks(deadline, request);
        self.handle_write_result_locked(inner, result, transfer_max_read_level)
    }

    /// Assign a fresh id to every task in every category, tracking the
    /// max as the proposed read level. Scheduled tasks whose fire time
    /// sits behind the cluster's read cursor are pushed just past it.
    fn allocate_task_ids_locked(
        &self,
        inner: &mut Inner,
        namespace: &Namespace,
        workflow_id: &str,
        tasks: &mut TasksByCategory,
        transfer_max_read_level: &mut i64,
    ) -> Result<(), ShardError> {
        for (category, tasks_for_category) in tasks.iter_mut() {
            for task in tasks_for_category.iter_mut() {
                let id = self.generate_task_id_locked(inner)?;
                tracing::debug!(shard = %self.shard_id, task_id = id, "assigned task id");
                task.task_id = id;
                *transfer_max_read_level = id;

                if category.kind() == CategoryKind::Scheduled {
                    // A versioned task must be keyed by the namespace's
                    // active cluster: during failover a timer created as
                    // passive would never be picked up by the active
                    // processing logic.
                    let cluster = if task.version != EMPTY_VERSION {
                        &namespace.active_cluster
                    } else {
                        self.cluster.current_cluster_name()
                    };
                    let read_cursor = inner
                        .scheduled_task_max_read_level
                        .get(cluster)
                        .copied()
                        .unwrap_or(ZERO_TIME);
                    if task.visibility_time < read_cursor {
                        // Shard moved to a host with clock skew, or a
                        // delayed db write; regenerate past the cursor.
                        tracing::debug!(
                            shard = %self.shard_id,
                            namespace = %namespace.id,
                            workflow_id,
                            fire_time = ?task.visibility_time,
                            cursor = ?read_cursor,
                            "scheduled task fire time below read cursor, clamping"
                        );
                        task.visibility_time = read_cursor + Duration::from_millis(1);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Copy close-task ids into the execution metadata so the closed
/// execution record points at its own close tasks.
fn update_close_task_ids(execution_info: &mut ExecutionInfo, tasks: &TasksByCategory) {
    if let Some(transfer_tasks) = tasks.get(&TaskCategory::Transfer) {
        for task in transfer_tasks {
            if task.kind == TaskKind::CloseExecution {
                execution_info.close_transfer_task_id = task.task_id;
                break;
            }
        }
    }
    if let Some(visibility_tasks) = tasks.get(&TaskCategory::Visibility) {
        for task in visibility_tasks {
            if task.kind == TaskKind::CloseExecutionVisibility {
                execution_info.close_visibility_task_id = task.task_id;
                break;
            }
        }
    }
}
