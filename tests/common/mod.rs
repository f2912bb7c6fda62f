//! Shared fixtures: in-memory fakes for the persistence driver, a
//! recording engine, a static namespace registry and a manual clock.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{Receiver, Sender, unbounded};
use uuid::Uuid;

use weft::config::ShardConfig;
use weft::persistence::{
    AddHistoryTasksRequest, AppendHistoryNodesRequest, AppendHistoryNodesResponse,
    ConflictResolveWorkflowExecutionRequest, CreateWorkflowExecutionRequest,
    DeleteCurrentWorkflowExecutionRequest, DeleteHistoryBranchRequest,
    DeleteWorkflowExecutionRequest, ExecutionStore, GetCurrentExecutionRequest,
    GetCurrentExecutionResponse, GetReplicationTasksFromDlqRequest,
    GetReplicationTasksFromDlqResponse, GetWorkflowExecutionRequest, GetWorkflowExecutionResponse,
    RangeDeleteReplicationTaskFromDlqRequest, SetWorkflowExecutionRequest, ShardStore, StoreError,
    UpdateWorkflowExecutionRequest,
};
use weft::{
    CancelToken, ClusterInfo, ClusterMetadata, ClusterName, Deadline, Engine, EngineFactory,
    Namespace, NamespaceId, NamespaceRegistry, RegistryError, ReplicationState, RunId,
    ShardContext, ShardId, ShardInfo, ShardParams, TaskCategory, TasksByCategory, TimeSource,
    WorkflowKey, ZERO_TIME,
};

pub fn t_ms(ms: u64) -> SystemTime {
    ZERO_TIME + Duration::from_millis(ms)
}

// =============================================================================
// Manual clock
// =============================================================================

pub struct ManualTimeSource {
    now: Mutex<SystemTime>,
}

impl ManualTimeSource {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Fake shard store
// =============================================================================

#[derive(Default)]
struct ShardRowState {
    row: Option<ShardInfo>,
    get_failures: VecDeque<StoreError>,
    update_failures: VecDeque<StoreError>,
    assert_failures: VecDeque<StoreError>,
    update_calls: usize,
}

/// In-memory shard row with CAS semantics and scriptable failures.
#[derive(Default)]
pub struct FakeShardStore {
    state: Mutex<ShardRowState>,
}

impl FakeShardStore {
    pub fn with_row(row: ShardInfo) -> Arc<Self> {
        let store = Self::default();
        store.state.lock().unwrap().row = Some(row);
        Arc::new(store)
    }

    pub fn row(&self) -> ShardInfo {
        self.state
            .lock()
            .unwrap()
            .row
            .clone()
            .expect("shard row present")
    }

    pub fn update_calls(&self) -> usize {
        self.state.lock().unwrap().update_calls
    }

    pub fn fail_next_get(&self, err: StoreError) {
        self.state.lock().unwrap().get_failures.push_back(err);
    }

    pub fn fail_next_update(&self, err: StoreError) {
        self.state.lock().unwrap().update_failures.push_back(err);
    }

    pub fn fail_next_assert(&self, err: StoreError) {
        self.state.lock().unwrap().assert_failures.push_back(err);
    }
}

impl ShardStore for FakeShardStore {
    fn get_or_create_shard(
        &self,
        _deadline: Deadline,
        shard_id: ShardId,
        lifecycle: &CancelToken,
    ) -> Result<ShardInfo, StoreError> {
        if lifecycle.is_cancelled() {
            return Err(StoreError::Unavailable {
                message: "lifecycle cancelled".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.get_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .row
            .get_or_insert_with(|| ShardInfo::new(shard_id))
            .clone())
    }

    fn update_shard(
        &self,
        _deadline: Deadline,
        info: &ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.update_calls += 1;
        if let Some(err) = state.update_failures.pop_front() {
            return Err(err);
        }
        let row = state.row.get_or_insert_with(|| info.clone());
        if row.range_id != previous_range_id {
            return Err(StoreError::ShardOwnershipLost {
                new_owner: row.owner.clone(),
            });
        }
        *row = info.clone();
        Ok(())
    }

    fn assert_shard_ownership(
        &self,
        _deadline: Deadline,
        _shard_id: ShardId,
        range_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.assert_failures.pop_front() {
            return Err(err);
        }
        let row = state.row.as_ref().expect("shard row present");
        if row.range_id != range_id {
            return Err(StoreError::ShardOwnershipLost {
                new_owner: row.owner.clone(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Fake execution store
// =============================================================================

#[derive(Default)]
struct ExecState {
    failures: BTreeMap<&'static str, VecDeque<StoreError>>,
    added_tasks: Vec<AddHistoryTasksRequest>,
    creates: Vec<CreateWorkflowExecutionRequest>,
    updates: Vec<UpdateWorkflowExecutionRequest>,
    conflict_resolves: Vec<ConflictResolveWorkflowExecutionRequest>,
    sets: Vec<SetWorkflowExecutionRequest>,
    deleted_current: Vec<DeleteCurrentWorkflowExecutionRequest>,
    deleted_state: Vec<DeleteWorkflowExecutionRequest>,
    deleted_branches: Vec<DeleteHistoryBranchRequest>,
    dlq: BTreeMap<ClusterName, BTreeMap<i64, weft::Task>>,
}

/// Records every request and lets tests script per-operation failures.
#[derive(Default)]
pub struct FakeExecutionStore {
    state: Mutex<ExecState>,
}

impl FakeExecutionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, op: &'static str, err: StoreError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    fn take_failure(&self, op: &'static str) -> Option<StoreError> {
        self.state
            .lock()
            .unwrap()
            .failures
            .get_mut(op)
            .and_then(VecDeque::pop_front)
    }

    pub fn added_tasks(&self) -> Vec<AddHistoryTasksRequest> {
        self.state.lock().unwrap().added_tasks.clone()
    }

    pub fn creates(&self) -> Vec<CreateWorkflowExecutionRequest> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn updates(&self) -> Vec<UpdateWorkflowExecutionRequest> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn deleted_current(&self) -> Vec<DeleteCurrentWorkflowExecutionRequest> {
        self.state.lock().unwrap().deleted_current.clone()
    }

    pub fn deleted_state(&self) -> Vec<DeleteWorkflowExecutionRequest> {
        self.state.lock().unwrap().deleted_state.clone()
    }

    pub fn deleted_branches(&self) -> Vec<DeleteHistoryBranchRequest> {
        self.state.lock().unwrap().deleted_branches.clone()
    }

    pub fn dlq_insert(&self, cluster: &ClusterName, task: weft::Task) {
        self.state
            .lock()
            .unwrap()
            .dlq
            .entry(cluster.clone())
            .or_default()
            .insert(task.task_id, task);
    }

    pub fn dlq_task_ids(&self, cluster: &ClusterName) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .dlq
            .get(cluster)
            .map(|tasks| tasks.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ExecutionStore for FakeExecutionStore {
    fn create_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("create") {
            return Err(err);
        }
        self.state.lock().unwrap().creates.push(request.clone());
        Ok(())
    }

    fn update_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("update") {
            return Err(err);
        }
        self.state.lock().unwrap().updates.push(request.clone());
        Ok(())
    }

    fn conflict_resolve_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &ConflictResolveWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("conflict_resolve") {
            return Err(err);
        }
        self.state
            .lock()
            .unwrap()
            .conflict_resolves
            .push(request.clone());
        Ok(())
    }

    fn set_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &SetWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("set") {
            return Err(err);
        }
        self.state.lock().unwrap().sets.push(request.clone());
        Ok(())
    }

    fn get_workflow_execution(
        &self,
        _deadline: Deadline,
        _request: &GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, StoreError> {
        if let Some(err) = self.take_failure("get") {
            return Err(err);
        }
        Err(StoreError::NotFound)
    }

    fn get_current_execution(
        &self,
        _deadline: Deadline,
        _request: &GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, StoreError> {
        if let Some(err) = self.take_failure("get_current") {
            return Err(err);
        }
        Err(StoreError::NotFound)
    }

    fn add_history_tasks(
        &self,
        _deadline: Deadline,
        request: &AddHistoryTasksRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("add_tasks") {
            return Err(err);
        }
        self.state.lock().unwrap().added_tasks.push(request.clone());
        Ok(())
    }

    fn append_history_nodes(
        &self,
        _deadline: Deadline,
        request: &AppendHistoryNodesRequest,
    ) -> Result<AppendHistoryNodesResponse, StoreError> {
        if let Some(err) = self.take_failure("append") {
            return Err(err);
        }
        Ok(AppendHistoryNodesResponse {
            size: request.events.len(),
        })
    }

    fn delete_current_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &DeleteCurrentWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("delete_current") {
            return Err(err);
        }
        self.state
            .lock()
            .unwrap()
            .deleted_current
            .push(request.clone());
        Ok(())
    }

    fn delete_workflow_execution(
        &self,
        _deadline: Deadline,
        request: &DeleteWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("delete_state") {
            return Err(err);
        }
        self.state
            .lock()
            .unwrap()
            .deleted_state
            .push(request.clone());
        Ok(())
    }

    fn delete_history_branch(
        &self,
        _deadline: Deadline,
        request: &DeleteHistoryBranchRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("delete_branch") {
            return Err(err);
        }
        self.state
            .lock()
            .unwrap()
            .deleted_branches
            .push(request.clone());
        Ok(())
    }

    fn get_replication_tasks_from_dlq(
        &self,
        _deadline: Deadline,
        request: &GetReplicationTasksFromDlqRequest,
    ) -> Result<GetReplicationTasksFromDlqResponse, StoreError> {
        if let Some(err) = self.take_failure("dlq_get") {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        let tasks = state
            .dlq
            .get(&request.source_cluster)
            .map(|tasks| {
                tasks
                    .range(request.min_task_id..request.max_task_id)
                    .take(request.batch_size)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(GetReplicationTasksFromDlqResponse {
            tasks,
            next_page_token: None,
        })
    }

    fn range_delete_replication_task_from_dlq(
        &self,
        _deadline: Deadline,
        request: &RangeDeleteReplicationTaskFromDlqRequest,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure("dlq_delete") {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(tasks) = state.dlq.get_mut(&request.source_cluster) {
            tasks.retain(|id, _| *id < request.min_task_id || *id >= request.max_task_id);
        }
        Ok(())
    }
}

// =============================================================================
// Recording engine
// =============================================================================

#[derive(Default)]
pub struct RecordingEngine {
    started: AtomicUsize,
    stopped: AtomicUsize,
    notifications: Mutex<Vec<(ClusterName, TasksByCategory)>>,
}

impl RecordingEngine {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<(ClusterName, TasksByCategory)> {
        self.notifications.lock().unwrap().clone()
    }
}

impl Engine for RecordingEngine {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_new_tasks(&self, cluster: &ClusterName, tasks: &TasksByCategory) {
        self.notifications
            .lock()
            .unwrap()
            .push((cluster.clone(), tasks.clone()));
    }
}

pub struct RecordingEngineFactory {
    pub engine: Arc<RecordingEngine>,
    created: AtomicUsize,
}

impl RecordingEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(RecordingEngine::default()),
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for RecordingEngineFactory {
    fn create_engine(&self, _shard: &Arc<ShardContext>) -> Arc<dyn Engine> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.engine) as Arc<dyn Engine>
    }
}

// =============================================================================
// Static namespace registry
// =============================================================================

#[derive(Default)]
pub struct StaticRegistry {
    namespaces: Mutex<BTreeMap<NamespaceId, Arc<Namespace>>>,
}

impl StaticRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, namespace: Namespace) {
        self.namespaces
            .lock()
            .unwrap()
            .insert(namespace.id, Arc::new(namespace));
    }

    pub fn remove(&self, id: &NamespaceId) {
        self.namespaces.lock().unwrap().remove(id);
    }
}

impl NamespaceRegistry for StaticRegistry {
    fn namespace_by_id(&self, id: &NamespaceId) -> Result<Arc<Namespace>, RegistryError> {
        self.namespaces
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const LOCAL_CLUSTER: &str = "active";
pub const REMOTE_CLUSTER: &str = "standby";

pub fn namespace(seed: u128, active_cluster: &str) -> Namespace {
    Namespace {
        id: NamespaceId::new(Uuid::from_u128(seed)),
        name: format!("ns-{seed}"),
        global: true,
        replication_state: ReplicationState::Normal,
        active_cluster: ClusterName::from(active_cluster),
        notification_version: 0,
    }
}

pub fn workflow_key(namespace_id: NamespaceId, seed: u128) -> WorkflowKey {
    WorkflowKey::new(namespace_id, format!("wf-{seed}"), RunId::new(Uuid::from_u128(seed)))
}

pub struct TestShard {
    pub ctx: Arc<ShardContext>,
    pub shard_store: Arc<FakeShardStore>,
    pub exec_store: Arc<FakeExecutionStore>,
    pub factory: Arc<RecordingEngineFactory>,
    pub registry: Arc<StaticRegistry>,
    pub time: Arc<ManualTimeSource>,
    pub closed_rx: Receiver<ShardId>,
}

impl TestShard {
    pub fn engine(&self) -> &Arc<RecordingEngine> {
        &self.factory.engine
    }
}

pub struct TestShardBuilder {
    shard_id: ShardId,
    owner_host: String,
    config: ShardConfig,
    row: ShardInfo,
    clusters: BTreeMap<ClusterName, ClusterInfo>,
}

impl TestShardBuilder {
    pub fn new() -> Self {
        let shard_id = ShardId::new(1);
        let mut row = ShardInfo::new(shard_id);
        row.owner = "previous-host".to_string();
        row.range_id = 4;

        let mut config = ShardConfig::default();
        // Fast-turnaround test settings: tiny ranges, no persist
        // throttle, quick retry expiry.
        config.range_size_bits = 8;
        config.shard_update_min_interval_ms = 0;
        config.acquire_initial_backoff_ms = 1;
        config.acquire_max_backoff_ms = 5;
        config.acquire_expiration_ms = 2_000;
        config.persistence_initial_backoff_ms = 1;
        config.persistence_max_backoff_ms = 2;
        config.persistence_expiration_ms = 50;

        let mut clusters = BTreeMap::new();
        clusters.insert(ClusterName::from(LOCAL_CLUSTER), ClusterInfo { enabled: true });
        clusters.insert(ClusterName::from(REMOTE_CLUSTER), ClusterInfo { enabled: true });

        Self {
            shard_id,
            owner_host: "this-host".to_string(),
            config,
            row,
            clusters,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut ShardConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn row(mut self, f: impl FnOnce(&mut ShardInfo)) -> Self {
        f(&mut self.row);
        self
    }

    pub fn build(self) -> TestShard {
        init_test_logging();
        let shard_store = FakeShardStore::with_row(self.row);
        let exec_store = FakeExecutionStore::new();
        let factory = RecordingEngineFactory::new();
        let registry = StaticRegistry::new();
        let time = Arc::new(ManualTimeSource::new(t_ms(1_000_000)));
        let (closed_tx, closed_rx): (Sender<ShardId>, Receiver<ShardId>) = unbounded();

        let shard_store_dyn: Arc<dyn ShardStore> = Arc::clone(&shard_store) as Arc<dyn ShardStore>;
        let exec_store_dyn: Arc<dyn ExecutionStore> =
            Arc::clone(&exec_store) as Arc<dyn ExecutionStore>;
        let registry_dyn: Arc<dyn NamespaceRegistry> =
            Arc::clone(&registry) as Arc<dyn NamespaceRegistry>;
        let time_dyn: Arc<dyn TimeSource> = Arc::clone(&time) as Arc<dyn TimeSource>;
        let factory_dyn: Arc<dyn EngineFactory> = Arc::clone(&factory) as Arc<dyn EngineFactory>;
        let ctx = ShardContext::new(ShardParams {
            shard_id: self.shard_id,
            owner_host: self.owner_host,
            config: Arc::new(self.config),
            shard_store: shard_store_dyn,
            execution_store: exec_store_dyn,
            registry: registry_dyn,
            cluster: Arc::new(ClusterMetadata::new(
                ClusterName::from(LOCAL_CLUSTER),
                self.clusters,
            )),
            time_source: time_dyn,
            engine_factory: factory_dyn,
            close_callback: Box::new(move |shard| {
                let _ = closed_tx.send(shard.shard_id());
            }),
        });

        TestShard {
            ctx,
            shard_store,
            exec_store,
            factory,
            registry,
            time,
            closed_rx,
        }
    }
}

/// Capture logs per test; `LOG=debug cargo test` to see them.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("LOG")
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

/// Start the context and block until the first acquisition completes.
pub fn start_and_wait(shard: &TestShard) {
    shard.ctx.start();
    wait_acquired(&shard.ctx);
}

pub fn wait_acquired(ctx: &Arc<ShardContext>) {
    wait_for(Duration::from_secs(5), || {
        ctx.queue_ack_level(TaskCategory::Transfer).is_ok()
    });
}

pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached within {timeout:?}");
}
