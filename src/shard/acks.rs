//! Ack-level registry, failover levels, handover and remote-cluster
//! tracking.
//!
//! Every ack level lives in two representations kept in sync for
//! rollback compatibility: the legacy per-category fields on the shard
//! row and the generic `queue_ack_levels` map. Readers prefer the
//! generic map and fall back to the legacy fields.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::{
    CategoryKind, ClusterName, Deadline, EMPTY_QUEUE_MESSAGE_ID, FailoverLevel, Namespace,
    ShardInfo, TaskCategory, TaskKey, ZERO_TIME, max_time, truncate_to_ms,
};
use crate::metrics;

use super::ShardError;
use super::context::{Inner, ShardContext, ShardReplicationStatus};

const LOG_WARN_IMMEDIATE_LEVEL_DIFF: i64 = 3_000_000;
const LOG_WARN_TIMER_LEVEL_DIFF: Duration = Duration::from_secs(30 * 60);

impl ShardContext {
    // ------------------------------------------------------------------
    // Read levels
    // ------------------------------------------------------------------

    /// Upper bound key that queue processors may dispatch up to.
    ///
    /// The scheduled variant is a writer: it advances the cluster's read
    /// cursor to cover `now + time shift` before returning it.
    pub fn queue_max_read_level(
        &self,
        category: TaskCategory,
        cluster: &ClusterName,
    ) -> Result<TaskKey, ShardError> {
        match category.kind() {
            CategoryKind::Immediate => {
                let inner = self.read();
                inner.check_state()?;
                Ok(TaskKey::immediate(inner.immediate_task_max_read_level))
            }
            CategoryKind::Scheduled => self.advance_scheduled_read_level(cluster),
        }
    }

    fn advance_scheduled_read_level(&self, cluster: &ClusterName) -> Result<TaskKey, ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        let now = if self.cluster.is_current(cluster) {
            self.time_source.now()
        } else {
            inner.remote_cluster_info_mut(cluster).current_time
        };
        let new_level = truncate_to_ms(now + self.config.timer_max_time_shift());

        let level = inner
            .scheduled_task_max_read_level
            .entry(cluster.clone())
            .or_insert(ZERO_TIME);
        *level = max_time(*level, new_level);
        Ok(TaskKey::scheduled(*level))
    }

    // ------------------------------------------------------------------
    // Global ack levels
    // ------------------------------------------------------------------

    pub fn queue_ack_level(&self, category: TaskCategory) -> Result<TaskKey, ShardError> {
        let inner = self.read();
        inner.check_state()?;
        Ok(queue_ack_level_locked(inner.info()?, category))
    }

    pub fn update_queue_ack_level(
        &self,
        category: TaskCategory,
        ack_level: TaskKey,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        // The caller passes the min ack level across every processor of
        // the queue (active, passive, failover).
        let info = inner.info_mut()?;
        match category {
            TaskCategory::Transfer => info.transfer_ack_level = ack_level.task_id,
            TaskCategory::Timer => info.timer_ack_level = Some(ack_level.fire_time),
            TaskCategory::Replication => info.replication_ack_level = ack_level.task_id,
            TaskCategory::Visibility => info.visibility_ack_level = ack_level.task_id,
        }
        info.queue_ack_levels
            .entry(category.id())
            .or_default()
            .ack_level = ack_level.to_ack_level(category.kind());
        info.stolen_since_renew = 0;

        self.update_shard_info_locked(&mut inner)
    }

    // ------------------------------------------------------------------
    // Per-cluster ack levels
    // ------------------------------------------------------------------

    pub fn queue_cluster_ack_level(
        &self,
        category: TaskCategory,
        cluster: &ClusterName,
    ) -> Result<TaskKey, ShardError> {
        let inner = self.read();
        inner.check_state()?;
        let info = inner.info()?;

        if let Some(levels) = info.queue_ack_levels.get(&category.id())
            && let Some(level) = levels.cluster_ack_level.get(cluster)
        {
            return Ok(TaskKey::from_ack_level(category.kind(), *level));
        }

        // Legacy per-cluster fields.
        match category {
            TaskCategory::Transfer => {
                if let Some(level) = info.cluster_transfer_ack_level.get(cluster) {
                    return Ok(TaskKey::immediate(*level));
                }
            }
            TaskCategory::Timer => {
                if let Some(fire_time) = info.cluster_timer_ack_level.get(cluster) {
                    return Ok(TaskKey::scheduled(*fire_time));
                }
            }
            TaskCategory::Replication => {
                if let Some(level) = info.cluster_replication_level.get(cluster) {
                    return Ok(TaskKey::immediate(*level));
                }
                return Ok(TaskKey::immediate(EMPTY_QUEUE_MESSAGE_ID));
            }
            TaskCategory::Visibility => {
                // Visibility keeps no per-cluster tracking.
            }
        }

        // Default to the global level, which belongs to the local
        // cluster. Happens when a new cluster joins.
        Ok(queue_ack_level_locked(info, category))
    }

    pub fn update_queue_cluster_ack_level(
        &self,
        category: TaskCategory,
        cluster: &ClusterName,
        mut ack_level: TaskKey,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        // The ack level cannot pass an in-progress failover.
        if let Some(levels) = inner.failover_levels.get(&category) {
            for failover_level in levels.values() {
                if ack_level > failover_level.current_level {
                    ack_level = failover_level.current_level;
                }
            }
        }

        let info = inner.info_mut()?;
        match category {
            TaskCategory::Transfer => {
                info.cluster_transfer_ack_level
                    .insert(cluster.clone(), ack_level.task_id);
            }
            TaskCategory::Timer => {
                info.cluster_timer_ack_level
                    .insert(cluster.clone(), ack_level.fire_time);
            }
            TaskCategory::Replication => {
                info.cluster_replication_level
                    .insert(cluster.clone(), ack_level.task_id);
            }
            TaskCategory::Visibility => {
                // Visibility keeps no legacy per-cluster mirror.
            }
        }
        info.queue_ack_levels
            .entry(category.id())
            .or_default()
            .cluster_ack_level
            .insert(cluster.clone(), ack_level.to_ack_level(category.kind()));
        info.stolen_since_renew = 0;

        self.update_shard_info_locked(&mut inner)
    }

    // ------------------------------------------------------------------
    // Replication DLQ ack levels
    // ------------------------------------------------------------------

    pub fn replicator_dlq_ack_level(&self, source_cluster: &ClusterName) -> Result<i64, ShardError> {
        let inner = self.read();
        inner.check_state()?;
        Ok(inner
            .info()?
            .replication_dlq_ack_level
            .get(source_cluster)
            .copied()
            .unwrap_or(EMPTY_QUEUE_MESSAGE_ID))
    }

    pub fn update_replicator_dlq_ack_level(
        &self,
        source_cluster: &ClusterName,
        ack_level: i64,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        let info = inner.info_mut()?;
        info.replication_dlq_ack_level
            .insert(source_cluster.clone(), ack_level);
        info.stolen_since_renew = 0;
        self.update_shard_info_locked(&mut inner)?;

        metrics::dlq_ack_level(source_cluster, ack_level);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failover levels
    // ------------------------------------------------------------------

    pub fn update_failover_level(
        &self,
        category: TaskCategory,
        failover_id: impl Into<String>,
        level: FailoverLevel,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        inner
            .failover_levels
            .entry(category)
            .or_default()
            .insert(failover_id.into(), level);
        self.update_shard_info_locked(&mut inner)
    }

    pub fn delete_failover_level(
        &self,
        category: TaskCategory,
        failover_id: &str,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        if let Some(levels) = inner.failover_levels.get_mut(&category)
            && let Some(level) = levels.remove(failover_id)
            && let Ok(elapsed) = self.time_source.now().duration_since(level.start_time)
        {
            metrics::failover_duration(category.name(), elapsed);
        }
        self.update_shard_info_locked(&mut inner)
    }

    pub fn all_failover_levels(
        &self,
        category: TaskCategory,
    ) -> Result<BTreeMap<String, FailoverLevel>, ShardError> {
        let inner = self.read();
        inner.check_state()?;
        Ok(inner
            .failover_levels
            .get(&category)
            .cloned()
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Namespace notification version & handover namespaces
    // ------------------------------------------------------------------

    pub fn namespace_notification_version(&self) -> Result<i64, ShardError> {
        let inner = self.read();
        inner.check_state()?;
        Ok(inner.info()?.namespace_notification_version)
    }

    /// Only ever advances.
    pub fn update_namespace_notification_version(&self, version: i64) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;
        {
            let info = inner.info_mut()?;
            if info.namespace_notification_version >= version {
                return Ok(());
            }
            info.namespace_notification_version = version;
        }
        self.update_shard_info_locked(&mut inner)
    }

    /// Replace the handover set with the handover members of
    /// `namespaces`. Entries already tracked advance only on a strictly
    /// newer notification version; entries no longer handed over are
    /// dropped.
    pub fn update_handover_namespaces(
        &self,
        namespaces: &[Arc<Namespace>],
        max_replication_task_id: i64,
    ) -> Result<(), ShardError> {
        let mut inner = self.write();
        inner.check_state()?;

        let mut retained = std::collections::BTreeSet::new();
        for namespace in namespaces {
            if !namespace.is_handover() {
                continue;
            }
            retained.insert(namespace.name.clone());
            match inner.handover_namespaces.entry(namespace.name.clone()) {
                Entry::Occupied(mut entry) => {
                    let handover = entry.get_mut();
                    if handover.notification_version < namespace.notification_version {
                        handover.notification_version = namespace.notification_version;
                        handover.max_replication_task_id = max_replication_task_id;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(super::context::HandoverInfo {
                        notification_version: namespace.notification_version,
                        max_replication_task_id,
                    });
                }
            }
        }
        inner
            .handover_namespaces
            .retain(|name, _| retained.contains(name));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote clusters
    // ------------------------------------------------------------------

    /// Record the wall clock last heard from a remote cluster.
    ///
    /// Panics when called with the local cluster: the local clock is the
    /// time source, and feeding it back is an API misuse.
    pub fn set_current_time(&self, cluster: &ClusterName, current_time: SystemTime) {
        assert!(
            !self.cluster.is_current(cluster),
            "cannot set current time for the local cluster"
        );
        let mut inner = self.write();
        let remote = inner.remote_cluster_info_mut(cluster);
        if remote.current_time < current_time {
            remote.current_time = current_time;
        }
    }

    pub fn current_time(&self, cluster: &ClusterName) -> SystemTime {
        if self.cluster.is_current(cluster) {
            return self.time_source.now();
        }
        self.read()
            .remote_cluster_infos
            .get(cluster)
            .map(|remote| remote.current_time)
            .unwrap_or(ZERO_TIME)
    }

    pub fn update_remote_cluster_info(
        &self,
        cluster: &ClusterName,
        acked_task_id: i64,
        acked_timestamp: SystemTime,
    ) {
        let mut inner = self.write();
        let remote = inner.remote_cluster_info_mut(cluster);
        remote.acked_replication_task_id = acked_task_id;
        remote.acked_replication_timestamp = acked_timestamp;
    }

    /// Replication bookkeeping for the requested clusters (all known
    /// remotes when `clusters` is empty) plus the handover-namespace
    /// map.
    pub fn replication_status(
        &self,
        clusters: &[ClusterName],
    ) -> Result<ShardReplicationStatus, ShardError> {
        let inner = self.read();
        inner.check_state()?;

        let mut status = ShardReplicationStatus::default();
        if clusters.is_empty() {
            status.remote_clusters = inner.remote_cluster_infos.clone();
        } else {
            for cluster in clusters {
                if let Some(remote) = inner.remote_cluster_infos.get(cluster) {
                    status.remote_clusters.insert(cluster.clone(), remote.clone());
                }
            }
        }
        for (name, handover) in &inner.handover_namespaces {
            status
                .handover_namespaces
                .insert(name.clone(), handover.max_replication_task_id);
        }
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Shard-row persistence
    // ------------------------------------------------------------------

    /// Best-effort persist of the in-memory shard row, throttled to at
    /// most one write per update interval.
    pub(super) fn update_shard_info_locked(&self, inner: &mut Inner) -> Result<(), ShardError> {
        inner.check_state()?;

        let now = self.time_source.now();
        if let Some(last_updated) = inner.last_updated
            && last_updated + self.config.shard_update_min_interval() > now
        {
            return Ok(());
        }

        self.emit_shard_lag_metrics_locked(inner);

        let previous_range_id = inner.info()?.range_id;
        let mut updated = inner.info()?.copy_for_update();
        updated.update_time = Some(now);

        let deadline = Deadline::after(self.config.shard_io_timeout());
        if let Err(err) = self.shard_store.update_shard(deadline, &updated, previous_range_id) {
            return Err(self.handle_write_error_locked(inner, err));
        }

        inner.shard_info = Some(updated);
        inner.last_updated = Some(now);
        Ok(())
    }

    fn emit_shard_lag_metrics_locked(&self, inner: &Inner) {
        let Ok(info) = inner.info() else { return };

        let enabled = |cluster: &ClusterName| {
            self.cluster
                .all_cluster_info()
                .get(cluster)
                .map(|c| c.enabled)
                .unwrap_or(false)
        };
        let current_cluster = self.cluster.current_cluster_name();

        let base_transfer = info
            .cluster_transfer_ack_level
            .get(current_cluster)
            .copied()
            .unwrap_or(0);
        let mut min_transfer = base_transfer;
        let mut max_transfer = base_transfer;
        for (cluster, level) in &info.cluster_transfer_ack_level {
            if !enabled(cluster) {
                continue;
            }
            min_transfer = min_transfer.min(*level);
            max_transfer = max_transfer.max(*level);
        }
        let transfer_level_diff = max_transfer - min_transfer;

        let base_timer = info
            .cluster_timer_ack_level
            .get(current_cluster)
            .copied()
            .unwrap_or(ZERO_TIME);
        let mut min_timer = base_timer;
        let mut max_timer = base_timer;
        for (cluster, fire_time) in &info.cluster_timer_ack_level {
            if !enabled(cluster) {
                continue;
            }
            min_timer = min_timer.min(*fire_time);
            max_timer = max_timer.max(*fire_time);
        }
        let timer_level_diff = max_timer.duration_since(min_timer).unwrap_or_default();

        let transfer_lag = inner.immediate_task_max_read_level - info.transfer_ack_level;
        let replication_lag = inner.immediate_task_max_read_level - info.replication_ack_level;
        let visibility_lag = inner.immediate_task_max_read_level - info.visibility_ack_level;
        let timer_lag = self
            .time_source
            .now()
            .duration_since(info.timer_ack_level.unwrap_or(ZERO_TIME))
            .unwrap_or_default();

        if self.config.emit_shard_lag_log
            && (transfer_level_diff > LOG_WARN_IMMEDIATE_LEVEL_DIFF
                || timer_level_diff > LOG_WARN_TIMER_LEVEL_DIFF
                || transfer_lag > LOG_WARN_IMMEDIATE_LEVEL_DIFF
                || timer_lag > LOG_WARN_TIMER_LEVEL_DIFF)
        {
            tracing::warn!(
                shard = %self.shard_id,
                transfer_level_diff,
                timer_level_diff_ms = timer_level_diff.as_millis() as u64,
                transfer_lag,
                timer_lag_ms = timer_lag.as_millis() as u64,
                "shard ack levels diff exceeds warn threshold"
            );
        }

        metrics::immediate_queue_lag("transfer", transfer_lag);
        metrics::immediate_queue_lag("replication", replication_lag);
        metrics::immediate_queue_lag("visibility", visibility_lag);
        metrics::timer_queue_lag(timer_lag);
        for category in [TaskCategory::Transfer, TaskCategory::Timer] {
            let in_progress = inner
                .failover_levels
                .get(&category)
                .map(BTreeMap::len)
                .unwrap_or(0);
            metrics::failover_in_progress(category.name(), in_progress);
        }
    }
}

fn queue_ack_level_locked(info: &ShardInfo, category: TaskCategory) -> TaskKey {
    if let Some(levels) = info.queue_ack_levels.get(&category.id())
        && levels.ack_level != 0
    {
        return TaskKey::from_ack_level(category.kind(), levels.ack_level);
    }

    // Legacy fields, kept for rollback compatibility.
    match category {
        TaskCategory::Transfer => TaskKey::immediate(info.transfer_ack_level),
        TaskCategory::Timer => TaskKey::scheduled(info.timer_ack_level.unwrap_or(ZERO_TIME)),
        TaskCategory::Replication => TaskKey::immediate(info.replication_ack_level),
        TaskCategory::Visibility => TaskKey::immediate(info.visibility_ack_level),
    }
}
