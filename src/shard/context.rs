//! Shard context: lifecycle, ownership state machine, task-id allocator.
//!
//! One instance is the single in-memory owner of one shard. A context is
//! constructed in `Initialized`, started exactly once by its controller,
//! and finished exactly once. All mutable state lives behind one
//! read/write guard; everything constant from initialization is read
//! without it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard, RwLock, Weak};
use std::thread;
use std::time::SystemTime;

use crate::backoff;
use crate::config::ShardConfig;
use crate::core::{
    CancelToken, CategoryKind, ClusterMetadata, ClusterName, Deadline, EMPTY_QUEUE_MESSAGE_ID,
    FailoverLevel, NamespaceRegistry, ShardClock, ShardId, ShardInfo, TaskCategory, TimeSource,
    ZERO_TIME, max_time, truncate_to_ms, unix_or_zero_time,
};
use crate::metrics;
use crate::persistence::{ExecutionStore, ShardStore, StoreError};

use super::ShardError;
use super::engine::{Engine, EngineCell, EngineFactory};

/// Per-remote-cluster replication bookkeeping. In memory only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteClusterInfo {
    pub current_time: SystemTime,
    pub acked_replication_task_id: i64,
    pub acked_replication_timestamp: SystemTime,
}

impl RemoteClusterInfo {
    fn new() -> Self {
        Self {
            current_time: ZERO_TIME,
            acked_replication_task_id: EMPTY_QUEUE_MESSAGE_ID,
            acked_replication_timestamp: ZERO_TIME,
        }
    }
}

/// Bookkeeping for a namespace in active-cluster handover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandoverInfo {
    pub notification_version: i64,
    pub max_replication_task_id: i64,
}

/// Snapshot returned by [`ShardContext::replication_status`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardReplicationStatus {
    /// Acked task id and ack timestamp per remote cluster.
    pub remote_clusters: BTreeMap<ClusterName, RemoteClusterInfo>,
    /// Max outstanding replication task id per handover namespace name.
    pub handover_namespaces: BTreeMap<String, i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum ContextState {
    Initialized,
    Acquiring,
    Acquired,
    Stopping,
    Stopped,
}

/// Requests handled by `transition_locked`. See the transition table on
/// that method.
#[derive(Clone, Copy, Debug)]
pub(super) enum Transition {
    Acquire,
    Acquired,
    Lost,
    Stop,
    FinishStop,
}

pub(super) struct Inner {
    pub(super) state: ContextState,
    pub(super) shard_info: Option<ShardInfo>,
    pub(super) failover_levels: BTreeMap<TaskCategory, BTreeMap<String, FailoverLevel>>,
    pub(super) last_updated: Option<SystemTime>,
    pub(super) task_sequence_number: i64,
    pub(super) max_task_sequence_number: i64,
    pub(super) immediate_task_max_read_level: i64,
    pub(super) scheduled_task_max_read_level: BTreeMap<ClusterName, SystemTime>,
    pub(super) remote_cluster_infos: BTreeMap<ClusterName, RemoteClusterInfo>,
    pub(super) handover_namespaces: BTreeMap<String, HandoverInfo>,
}

impl Inner {
    /// Status error for the current state: operations fail fast unless
    /// the range lease is held.
    pub(super) fn check_state(&self) -> Result<(), ShardError> {
        match self.state {
            ContextState::Initialized | ContextState::Acquiring => {
                Err(ShardError::ShardStatusUnknown)
            }
            ContextState::Acquired => Ok(()),
            ContextState::Stopping | ContextState::Stopped => Err(ShardError::ShardClosed),
        }
    }

    pub(super) fn info(&self) -> Result<&ShardInfo, ShardError> {
        self.shard_info.as_ref().ok_or(ShardError::ShardStatusUnknown)
    }

    pub(super) fn info_mut(&mut self) -> Result<&mut ShardInfo, ShardError> {
        self.shard_info.as_mut().ok_or(ShardError::ShardStatusUnknown)
    }

    pub(super) fn remote_cluster_info_mut(&mut self, cluster: &ClusterName) -> &mut RemoteClusterInfo {
        self.remote_cluster_infos
            .entry(cluster.clone())
            .or_insert_with(RemoteClusterInfo::new)
    }
}

/// Dependencies injected at construction. All constant for the life of
/// the context.
pub struct ShardParams {
    pub shard_id: ShardId,
    /// Identity this host writes into the shard row's `owner` field.
    pub owner_host: String,
    pub config: Arc<ShardConfig>,
    pub shard_store: Arc<dyn ShardStore>,
    pub execution_store: Arc<dyn ExecutionStore>,
    pub registry: Arc<dyn NamespaceRegistry>,
    pub cluster: Arc<ClusterMetadata>,
    pub time_source: Arc<dyn TimeSource>,
    pub engine_factory: Arc<dyn EngineFactory>,
    /// Invoked (on its own thread) when the context transitions to
    /// `Stopping`; the controller removes the shard from its map and
    /// calls `finish_stop`.
    pub close_callback: Box<dyn Fn(Arc<ShardContext>) + Send + Sync>,
}

pub struct ShardContext {
    weak: Weak<ShardContext>,

    pub(super) shard_id: ShardId,
    pub(super) owner_host: String,
    pub(super) config: Arc<ShardConfig>,
    pub(super) shard_store: Arc<dyn ShardStore>,
    pub(super) execution_store: Arc<dyn ExecutionStore>,
    pub(super) registry: Arc<dyn NamespaceRegistry>,
    pub(super) cluster: Arc<ClusterMetadata>,
    pub(super) time_source: Arc<dyn TimeSource>,
    engine_factory: Arc<dyn EngineFactory>,
    close_callback: Box<dyn Fn(Arc<ShardContext>) + Send + Sync>,

    pub(super) lifecycle: CancelToken,
    pub(super) engine_cell: EngineCell,
    pub(super) inner: RwLock<Inner>,
}

impl ShardContext {
    pub fn new(params: ShardParams) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            shard_id: params.shard_id,
            owner_host: params.owner_host,
            config: params.config,
            shard_store: params.shard_store,
            execution_store: params.execution_store,
            registry: params.registry,
            cluster: params.cluster,
            time_source: params.time_source,
            engine_factory: params.engine_factory,
            close_callback: params.close_callback,
            lifecycle: CancelToken::new(),
            engine_cell: EngineCell::new(),
            inner: RwLock::new(Inner {
                state: ContextState::Initialized,
                shard_info: None,
                failover_levels: BTreeMap::new(),
                last_updated: None,
                task_sequence_number: 0,
                max_task_sequence_number: 0,
                immediate_task_max_read_level: 0,
                scheduled_task_max_read_level: BTreeMap::new(),
                remote_cluster_infos: BTreeMap::new(),
                handover_namespaces: BTreeMap::new(),
            }),
        })
    }

    fn arc(&self) -> Arc<ShardContext> {
        self.weak.upgrade().expect("shard context alive while borrowed")
    }

    pub(super) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Constant accessors
    // ------------------------------------------------------------------

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn config(&self) -> &Arc<ShardConfig> {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterMetadata> {
        &self.cluster
    }

    pub fn execution_store(&self) -> &Arc<dyn ExecutionStore> {
        &self.execution_store
    }

    pub fn registry(&self) -> &Arc<dyn NamespaceRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch background acquisition. Controller-only; called once.
    pub fn start(&self) {
        let mut inner = self.write();
        self.transition_locked(&mut inner, Transition::Acquire);
    }

    /// Surrender the shard. Safe to call from anywhere.
    pub fn unload(&self) {
        let mut inner = self.write();
        self.transition_locked(&mut inner, Transition::Stop);
    }

    /// Final stop. Controller-only; called exactly once per context,
    /// even when the stopping state was skipped.
    pub fn finish_stop(&self) {
        // In case we skipped the stopping state (controller shutdown or
        // forced unload).
        self.lifecycle.cancel();

        let engine = {
            let mut inner = self.write();
            self.transition_locked(&mut inner, Transition::FinishStop);
            // The lifecycle token is cancelled, so never block here.
            self.engine_cell.try_get().and_then(Result::ok)
        };

        if let Some(engine) = engine {
            tracing::info!(shard = %self.shard_id, "stopping shard engine");
            engine.stop();
            tracing::info!(shard = %self.shard_id, "shard engine stopped");
        }
    }

    pub fn is_valid(&self) -> bool {
        self.read().state < ContextState::Stopping
    }

    /// Resolve the engine, blocking until first acquisition completes,
    /// the deadline passes, or the shard stops.
    pub fn engine(&self, deadline: Deadline) -> Result<Arc<dyn Engine>, ShardError> {
        self.engine_cell.get(deadline, &self.lifecycle)
    }

    pub fn last_updated_time(&self) -> Option<SystemTime> {
        self.read().last_updated
    }

    // ------------------------------------------------------------------
    // Task-id allocator
    // ------------------------------------------------------------------

    pub fn generate_task_id(&self) -> Result<i64, ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        self.generate_task_id_locked(&mut inner)
    }

    pub fn generate_task_ids(&self, count: usize) -> Result<Vec<i64>, ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.generate_task_id_locked(&mut inner)?);
        }
        Ok(ids)
    }

    /// Exclusive ceiling of the current reservation window, minus one.
    pub fn max_task_id_for_current_range(&self) -> i64 {
        self.read().max_task_sequence_number - 1
    }

    pub fn new_vector_clock(&self) -> Result<ShardClock, ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        let clock = self.generate_task_id_locked(&mut inner)?;
        Ok(ShardClock::new(self.shard_id, clock))
    }

    pub fn current_vector_clock(&self) -> ShardClock {
        let inner = self.read();
        ShardClock::new(self.shard_id, inner.task_sequence_number)
    }

    pub(super) fn generate_task_id_locked(&self, inner: &mut Inner) -> Result<i64, ShardError> {
        self.update_range_if_needed_locked(inner)?;
        let id = inner.task_sequence_number;
        inner.task_sequence_number += 1;
        Ok(id)
    }

    fn update_range_if_needed_locked(&self, inner: &mut Inner) -> Result<(), ShardError> {
        if inner.task_sequence_number < inner.max_task_sequence_number {
            return Ok(());
        }
        self.renew_range_locked(inner, false)
    }

    /// Bump the range id through a CAS on the shard row and recompute
    /// the reservation window. Stealing renewals also count the steal.
    pub(super) fn renew_range_locked(
        &self,
        inner: &mut Inner,
        is_stealing: bool,
    ) -> Result<(), ShardError> {
        let info = inner.info()?;
        let previous_range_id = info.range_id;
        let mut updated = info.copy_for_update();
        updated.range_id += 1;
        if is_stealing {
            updated.stolen_since_renew += 1;
        }

        let deadline = Deadline::after(self.config.shard_io_timeout());
        if let Err(err) = self.shard_store.update_shard(deadline, &updated, previous_range_id) {
            metrics::shard_range_renew_err();
            tracing::error!(
                shard = %self.shard_id,
                range_id = updated.range_id,
                previous_range_id,
                error = %err,
                "failed to renew shard range"
            );
            return Err(self.handle_write_error_locked(inner, err));
        }
        metrics::shard_range_renew_ok();
        tracing::info!(
            shard = %self.shard_id,
            range_id = updated.range_id,
            previous_range_id,
            sequence = inner.task_sequence_number,
            sequence_max = inner.max_task_sequence_number,
            "shard range renewed"
        );

        let bits = self.config.range_size_bits;
        inner.task_sequence_number = updated.range_id << bits;
        inner.max_task_sequence_number = (updated.range_id + 1) << bits;
        inner.immediate_task_max_read_level = inner.task_sequence_number - 1;
        inner.shard_info = Some(updated);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write-error classification
    // ------------------------------------------------------------------

    pub(super) fn advance_max_read_level_locked(&self, inner: &mut Inner, level: i64) {
        if level > inner.immediate_task_max_read_level {
            tracing::debug!(shard = %self.shard_id, level, "advancing immediate max read level");
            inner.immediate_task_max_read_level = level;
        }
    }

    /// Post-write policy. Success advances the read level; condition
    /// failures pass through untouched; ownership loss surrenders the
    /// shard; anything else is outcome-unknown and triggers background
    /// re-acquisition so the next read against the new range resolves
    /// the write authoritatively.
    pub(super) fn handle_write_result_locked<T>(
        &self,
        inner: &mut Inner,
        result: Result<T, StoreError>,
        new_max_read_level: i64,
    ) -> Result<T, ShardError> {
        match result {
            Ok(value) => {
                self.advance_max_read_level_locked(inner, new_max_read_level);
                Ok(value)
            }
            Err(err) => Err(self.handle_write_error_locked(inner, err)),
        }
    }

    pub(super) fn handle_write_error_locked(&self, inner: &mut Inner, err: StoreError) -> ShardError {
        match &err {
            StoreError::CurrentWorkflowConditionFailed { .. }
            | StoreError::WorkflowConditionFailed { .. }
            | StoreError::ConditionFailed { .. }
            | StoreError::ResourceExhausted { .. } => {
                // The write definitely did not commit.
                ShardError::Store(err)
            }
            StoreError::ShardOwnershipLost { .. } => {
                self.transition_locked(inner, Transition::Stop);
                ShardError::Store(err)
            }
            _ => {
                self.transition_locked(inner, Transition::Lost);
                ShardError::Store(err)
            }
        }
    }

    /// Read-path policy: only ownership loss is special.
    pub(super) fn handle_read_error(&self, err: StoreError) -> ShardError {
        if matches!(err, StoreError::ShardOwnershipLost { .. }) {
            self.unload();
        }
        ShardError::Store(err)
    }

    /// Substitute a fresh minimum deadline when the caller's is shorter.
    /// The fresh deadline is rooted in the process, not the caller.
    pub(super) fn ensure_min_timeout(&self, deadline: Deadline) -> Result<Deadline, ShardError> {
        if deadline.expired() {
            return Err(ShardError::DeadlineExceeded);
        }
        match deadline.remaining() {
            None => Ok(deadline),
            Some(remaining) if remaining >= self.config.min_mutation_timeout() => Ok(deadline),
            Some(_) => Ok(Deadline::after(self.config.min_mutation_timeout())),
        }
    }

    // ------------------------------------------------------------------
    // Ownership assertion
    // ------------------------------------------------------------------

    pub fn assert_ownership(&self, deadline: Deadline) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        let range_id = inner.info()?.range_id;
        let result = self
            .shard_store
            .assert_shard_ownership(deadline, self.shard_id, range_id);
        self.handle_write_result_locked(&mut inner, result, 0)
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /* State transitions:

    The normal pattern:
        Initialized --start()--> Acquiring --acquired--> Acquired

    Transient persistence error on a write:
        Acquired --lost--> Acquiring --acquired--> Acquired

    Ownership lost:
        Acquired --stop--> Stopping --finishStop--> Stopped

    Invariants:
    - Once Stopping, the only exit is Stopped; Stopped is terminal.
    - If state is Acquiring, an acquire thread is running.
    - Only the acquire thread requests Acquired.
    - Once Acquired has been reached and Stopped has not, the engine
      slot is set.
    - Only the controller calls start() and finish_stop(), and it calls
      finish_stop() for every context it creates.
    */
    pub(super) fn transition_locked(&self, inner: &mut Inner, request: Transition) {
        use ContextState::{Acquired, Acquiring, Initialized, Stopped, Stopping};

        match (inner.state, request) {
            (Initialized, Transition::Acquire) => self.set_state_acquiring(inner),
            (Acquiring, Transition::Acquire | Transition::Lost) => {
                // nothing to do, already acquiring
            }
            (Acquiring, Transition::Acquired) => inner.state = Acquired,
            (Acquired, Transition::Acquire) => {
                // nothing to do, already acquired
            }
            (Acquired, Transition::Lost) => self.set_state_acquiring(inner),
            (Initialized | Acquiring | Acquired, Transition::Stop) => {
                self.set_state_stopping(inner);
            }
            (Stopping, Transition::Stop) => {
                // nothing to do, already stopping
            }
            (Initialized | Acquiring | Acquired | Stopping, Transition::FinishStop) => {
                inner.state = Stopped;
            }
            (state, request) => {
                tracing::warn!(
                    shard = %self.shard_id,
                    ?state,
                    ?request,
                    "invalid shard state transition request"
                );
            }
        }
    }

    fn set_state_acquiring(&self, inner: &mut Inner) {
        inner.state = ContextState::Acquiring;
        let ctx = self.arc();
        thread::spawn(move || ctx.acquire_shard());
    }

    fn set_state_stopping(&self, inner: &mut Inner) {
        inner.state = ContextState::Stopping;
        // The state change already fails all write methods; lowering the
        // range id also fails any straggler at the persistence level.
        if let Some(info) = inner.shard_info.as_mut() {
            info.range_id = -1;
        }
        // Cancel the lifecycle as soon as we know we're shutting down.
        self.lifecycle.cancel();
        // The controller removes this shard from its map and then calls
        // finish_stop().
        let ctx = self.arc();
        thread::spawn(move || (ctx.close_callback)(Arc::clone(&ctx)));
    }

    // ------------------------------------------------------------------
    // Background acquisition
    // ------------------------------------------------------------------

    /// Load the shard row on first acquisition. Once loaded, later
    /// re-acquisitions only re-take the range lease.
    fn load_shard_metadata(&self, ownership_changed: &mut bool) -> Result<(), ShardError> {
        {
            let inner = self.read();
            if inner.state >= ContextState::Stopping {
                return Err(ShardError::StoppingContext);
            }
            if inner.shard_info.is_some() {
                return Ok(());
            }
        }

        // No shard info yet: load it outside the guard.
        let deadline = Deadline::after(self.config.shard_io_timeout());
        let loaded = self
            .shard_store
            .get_or_create_shard(deadline, self.shard_id, &self.lifecycle)
            .map_err(|err| {
                tracing::error!(shard = %self.shard_id, error = %err, "failed to load shard");
                ShardError::Store(err)
            })?;

        *ownership_changed = loaded.owner != self.owner_host;
        let mut info = loaded.copy_for_update();
        info.owner = self.owner_host.clone();

        // Initialize each cluster's scheduled read cursor (and remote
        // current time) from the highest timer ack level on record.
        let mut remote_infos = BTreeMap::new();
        let mut scheduled = BTreeMap::new();
        let current_cluster = self.cluster.current_cluster_name();
        for (cluster_name, cluster_info) in self.cluster.all_cluster_info() {
            if !cluster_info.enabled {
                continue;
            }

            let mut max_read_time = info.timer_ack_level.unwrap_or(ZERO_TIME);
            if let Some(t) = info.cluster_timer_ack_level.get(cluster_name) {
                max_read_time = max_time(max_read_time, *t);
            }
            for category in TaskCategory::categories() {
                if category.kind() != CategoryKind::Scheduled {
                    continue;
                }
                if let Some(levels) = info.queue_ack_levels.get(&category.id()) {
                    if levels.ack_level != 0 {
                        max_read_time = max_time(max_read_time, unix_or_zero_time(levels.ack_level));
                    }
                    if let Some(level) = levels.cluster_ack_level.get(cluster_name) {
                        max_read_time = max_time(max_read_time, unix_or_zero_time(*level));
                    }
                }
            }

            scheduled.insert(cluster_name.clone(), truncate_to_ms(max_read_time));
            if cluster_name != current_cluster {
                let mut remote = RemoteClusterInfo::new();
                remote.current_time = max_read_time;
                remote_infos.insert(cluster_name.clone(), remote);
            }
        }

        let mut inner = self.write();
        if inner.state >= ContextState::Stopping {
            return Err(ShardError::StoppingContext);
        }
        inner.shard_info = Some(info);
        inner.remote_cluster_infos = remote_infos;
        inner.scheduled_task_max_read_level = scheduled;
        Ok(())
    }

    fn try_acquire(&self, ownership_changed: &mut bool) -> Result<(), ShardError> {
        self.load_shard_metadata(ownership_changed)?;

        let mut inner = self.write();
        if inner.state >= ContextState::Stopping {
            return Err(ShardError::StoppingContext);
        }

        // Take the range lease. On ShardOwnershipLost this transitions
        // to Stopping right here; on other transient errors the Lost
        // request is a no-op since we're already Acquiring.
        self.renew_range_locked(&mut inner, true)?;

        tracing::info!(shard = %self.shard_id, "acquired shard");

        // The first time we get the shard we have to create the engine,
        // with the guard released. Safe because from Acquiring the only
        // transition someone else can make is to Stopped, and with no
        // engine published nobody can be calling mutating methods yet.
        if !self.engine_cell.ready() {
            drop(inner);
            self.maybe_record_acquisition_latency(*ownership_changed);
            let engine = self.create_engine();
            let mut inner = self.write();
            if inner.state >= ContextState::Stopping {
                // Stop raced us: the stop transition couldn't stop the
                // engine we just created, so do it here and unblock any
                // engine waiters.
                engine.stop();
                self.engine_cell.set(Err(ShardError::StoppingContext));
                return Err(ShardError::StoppingContext);
            }
            self.engine_cell.set(Ok(engine));
            self.transition_locked(&mut inner, Transition::Acquired);
        } else {
            self.transition_locked(&mut inner, Transition::Acquired);
        }
        Ok(())
    }

    fn acquire_shard(self: Arc<Self>) {
        let policy = self.config.acquire_retry_policy();
        // Remember across attempts: only the first load observes the
        // previous owner.
        let mut ownership_changed = false;

        let result = backoff::retry(
            policy,
            &self.lifecycle,
            |err: &ShardError| err.transience().is_retryable(),
            || self.try_acquire(&mut ownership_changed),
        );

        match result {
            Ok(()) => {}
            Err(ShardError::StoppingContext) => {
                // State changed since this thread started; exit silently.
            }
            Err(err) => {
                // Unretryable error or retries exhausted.
                tracing::error!(shard = %self.shard_id, error = %err, "couldn't acquire shard");
                let mut inner = self.write();
                if inner.state >= ContextState::Stopping {
                    return;
                }
                self.transition_locked(&mut inner, Transition::Stop);
            }
        }
    }

    fn create_engine(&self) -> Arc<dyn Engine> {
        tracing::info!(shard = %self.shard_id, "starting shard engine");
        let engine = self.engine_factory.create_engine(&self.arc());
        engine.start();
        tracing::info!(shard = %self.shard_id, "shard engine started");
        engine
    }

    fn maybe_record_acquisition_latency(&self, ownership_changed: bool) {
        if !ownership_changed {
            return;
        }
        let last_updated = self.read().last_updated;
        if let Some(last_updated) = last_updated
            && let Ok(latency) = self.time_source.now().duration_since(last_updated)
        {
            metrics::shard_acquisition_latency(latency);
        }
    }
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("ShardContext")
            .field("shard_id", &self.shard_id)
            .field("state", &inner.state)
            .field("range_id", &inner.shard_info.as_ref().map(|i| i.range_id))
            .finish_non_exhaustive()
    }
}
