//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test
//! sink can be installed to capture emissions in unit tests.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::ClusterName;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(i64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Histogram(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> = std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

/// Time from losing contact with the previous owner to serving traffic,
/// recorded only when ownership actually moved between hosts.
pub fn shard_acquisition_latency(duration: Duration) {
    emit(
        "shard_acquisition_latency",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn shard_range_renew_ok() {
    emit("shard_range_renew_ok", MetricValue::Counter(1), Vec::new());
}

pub fn shard_range_renew_err() {
    emit("shard_range_renew_err", MetricValue::Counter(1), Vec::new());
}

pub fn failover_duration(category: &'static str, duration: Duration) {
    emit(
        "shard_failover_duration",
        MetricValue::Histogram(duration_ms(duration)),
        vec![MetricLabel {
            key: "category",
            value: category.to_string(),
        }],
    );
}

pub fn failover_in_progress(category: &'static str, count: usize) {
    emit(
        "shard_failover_in_progress",
        MetricValue::Gauge(count as i64),
        vec![MetricLabel {
            key: "category",
            value: category.to_string(),
        }],
    );
}

pub fn dlq_ack_level(source_cluster: &ClusterName, level: i64) {
    emit(
        "replication_dlq_ack_level",
        MetricValue::Gauge(level),
        vec![MetricLabel {
            key: "source_cluster",
            value: source_cluster.to_string(),
        }],
    );
}

/// Lag of an immediate queue: max read level minus the queue's ack
/// level.
pub fn immediate_queue_lag(category: &'static str, lag: i64) {
    emit(
        "shard_queue_lag",
        MetricValue::Gauge(lag),
        vec![MetricLabel {
            key: "category",
            value: category.to_string(),
        }],
    );
}

pub fn timer_queue_lag(duration: Duration) {
    emit(
        "shard_timer_queue_lag",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn history_size(bytes: u64) {
    emit("history_size", MetricValue::Histogram(bytes), Vec::new());
}
