use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    // Consumption
    //
    // `role` is either "duplicator" or "sync_worker"; `event_type` is bounded
    // by EventType::metric_label so unknown kinds cannot explode cardinality.
    static ref NOTIFICATIONS_CONSUMED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_notifications_consumed_total",
            "Total notifications received by role"
        ),
        &["role"]
    ).unwrap();
    static ref NOTIFICATIONS_SKIPPED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_notifications_skipped_total",
            "Notifications handled without any action, by role and event type"
        ),
        &["role", "event_type"]
    ).unwrap();
    static ref NOTIFICATIONS_MALFORMED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_notifications_malformed_total",
            "Notifications rejected because they could not be parsed"
        ),
        &["role"]
    ).unwrap();
    static ref MESSAGES_ACKED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_messages_acked_total",
            "Total messages acknowledged"
        ),
        &["queue"]
    ).unwrap();
    static ref MESSAGES_NACKED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_messages_nacked_total",
            "Total messages negatively acknowledged"
        ),
        &["queue", "requeue"]
    ).unwrap();

    // Fan-out
    static ref FANOUT_PUBLISHES_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_fanout_publishes_total",
            "Notifications republished to a node queue"
        ),
        &["node"]
    ).unwrap();
    static ref FANOUT_FAILURES_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_fanout_failures_total",
            "Node publishes that failed after all retries"
        ),
        &["node"]
    ).unwrap();
    static ref FANOUT_DURATION_HISTOGRAM: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "image_sync_fanout_duration_seconds",
            "Time spent fanning one notification out to every node"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    ).unwrap();

    // Sync worker actions
    static ref TRANSFERS_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "image_sync_transfers_total",
            "Remote image copies by outcome"
        ),
        &["outcome"]
    ).unwrap();
    static ref TRANSFER_DURATION_HISTOGRAM: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "image_sync_transfer_duration_seconds",
            "Wall time of a single remote copy attempt"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0])
    ).unwrap();
    static ref DELETES_COUNTER: Counter = Counter::new(
        "image_sync_deletes_total",
        "Local image files deleted"
    ).unwrap();
    static ref DELETES_DEFERRED_COUNTER: Counter = Counter::new(
        "image_sync_deletes_deferred_total",
        "Deletes left for redelivery because a transfer was in flight"
    ).unwrap();
    static ref DELETES_ABANDONED_COUNTER: Counter = Counter::new(
        "image_sync_deletes_abandoned_total",
        "Deletes dropped after redelivery while a transfer was still in flight"
    ).unwrap();

    // Process health
    static ref RABBITMQ_HEALTHY_GAUGE: Gauge = Gauge::new(
        "image_sync_rabbitmq_healthy",
        "RabbitMQ connection health status (1=healthy, 0=unhealthy)"
    ).unwrap();
    static ref UPTIME_GAUGE: Gauge = Gauge::new(
        "image_sync_uptime_seconds",
        "Application uptime in seconds"
    ).unwrap();
}

#[derive(Debug, Clone)]
pub struct Metrics {
    notifications_consumed: Arc<AtomicU64>,
    notifications_skipped: Arc<AtomicU64>,
    fanout_publishes: Arc<AtomicU64>,
    fanout_failures: Arc<AtomicU64>,
    transfers_succeeded: Arc<AtomicU64>,
    transfers_failed: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
    deletes_deferred: Arc<AtomicU64>,

    start_time: DateTime<Utc>,
    last_event_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    rabbitmq_healthy: Arc<RwLock<bool>>,
}

impl Metrics {
    pub fn new() -> Self {
        // Registration failures (e.g. a second Metrics in the same process)
        // are logged and otherwise ignored.
        let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
            ("NOTIFICATIONS_CONSUMED_COUNTER", Box::new(NOTIFICATIONS_CONSUMED_COUNTER.clone())),
            ("NOTIFICATIONS_SKIPPED_COUNTER", Box::new(NOTIFICATIONS_SKIPPED_COUNTER.clone())),
            ("NOTIFICATIONS_MALFORMED_COUNTER", Box::new(NOTIFICATIONS_MALFORMED_COUNTER.clone())),
            ("MESSAGES_ACKED_COUNTER", Box::new(MESSAGES_ACKED_COUNTER.clone())),
            ("MESSAGES_NACKED_COUNTER", Box::new(MESSAGES_NACKED_COUNTER.clone())),
            ("FANOUT_PUBLISHES_COUNTER", Box::new(FANOUT_PUBLISHES_COUNTER.clone())),
            ("FANOUT_FAILURES_COUNTER", Box::new(FANOUT_FAILURES_COUNTER.clone())),
            ("FANOUT_DURATION_HISTOGRAM", Box::new(FANOUT_DURATION_HISTOGRAM.clone())),
            ("TRANSFERS_COUNTER", Box::new(TRANSFERS_COUNTER.clone())),
            ("TRANSFER_DURATION_HISTOGRAM", Box::new(TRANSFER_DURATION_HISTOGRAM.clone())),
            ("DELETES_COUNTER", Box::new(DELETES_COUNTER.clone())),
            ("DELETES_DEFERRED_COUNTER", Box::new(DELETES_DEFERRED_COUNTER.clone())),
            ("DELETES_ABANDONED_COUNTER", Box::new(DELETES_ABANDONED_COUNTER.clone())),
            ("RABBITMQ_HEALTHY_GAUGE", Box::new(RABBITMQ_HEALTHY_GAUGE.clone())),
            ("UPTIME_GAUGE", Box::new(UPTIME_GAUGE.clone())),
        ];
        for (name, collector) in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!("Failed to register {}: {}", name, e);
            }
        }

        Self {
            notifications_consumed: Arc::new(AtomicU64::new(0)),
            notifications_skipped: Arc::new(AtomicU64::new(0)),
            fanout_publishes: Arc::new(AtomicU64::new(0)),
            fanout_failures: Arc::new(AtomicU64::new(0)),
            transfers_succeeded: Arc::new(AtomicU64::new(0)),
            transfers_failed: Arc::new(AtomicU64::new(0)),
            deletes: Arc::new(AtomicU64::new(0)),
            deletes_deferred: Arc::new(AtomicU64::new(0)),
            start_time: Utc::now(),
            last_event_time: Arc::new(RwLock::new(None)),
            rabbitmq_healthy: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn record_notification_consumed(&self, role: &str) {
        self.notifications_consumed.fetch_add(1, Ordering::Relaxed);
        NOTIFICATIONS_CONSUMED_COUNTER
            .with_label_values(&[role])
            .inc();
        *self.last_event_time.write().await = Some(Utc::now());
    }

    pub fn record_notification_skipped(&self, role: &str, event_type: &str) {
        self.notifications_skipped.fetch_add(1, Ordering::Relaxed);
        NOTIFICATIONS_SKIPPED_COUNTER
            .with_label_values(&[role, event_type])
            .inc();
    }

    pub fn record_notification_malformed(&self, role: &str) {
        NOTIFICATIONS_MALFORMED_COUNTER
            .with_label_values(&[role])
            .inc();
    }

    pub fn record_message_acked(&self, queue: &str) {
        MESSAGES_ACKED_COUNTER.with_label_values(&[queue]).inc();
    }

    pub fn record_message_nacked(&self, queue: &str, requeue: bool) {
        let requeue = if requeue { "true" } else { "false" };
        MESSAGES_NACKED_COUNTER
            .with_label_values(&[queue, requeue])
            .inc();
    }

    pub fn record_fanout_publish(&self, node: &str) {
        self.fanout_publishes.fetch_add(1, Ordering::Relaxed);
        FANOUT_PUBLISHES_COUNTER.with_label_values(&[node]).inc();
    }

    pub fn record_fanout_failure(&self, node: &str) {
        self.fanout_failures.fetch_add(1, Ordering::Relaxed);
        FANOUT_FAILURES_COUNTER.with_label_values(&[node]).inc();
    }

    pub fn record_fanout_duration(&self, duration: std::time::Duration) {
        FANOUT_DURATION_HISTOGRAM.observe(duration.as_secs_f64());
    }

    pub fn record_transfer(&self, success: bool, duration: std::time::Duration) {
        if success {
            self.transfers_succeeded.fetch_add(1, Ordering::Relaxed);
            TRANSFERS_COUNTER.with_label_values(&["success"]).inc();
        } else {
            self.transfers_failed.fetch_add(1, Ordering::Relaxed);
            TRANSFERS_COUNTER.with_label_values(&["failure"]).inc();
        }
        TRANSFER_DURATION_HISTOGRAM.observe(duration.as_secs_f64());
    }

    pub fn record_transfer_abandoned(&self) {
        TRANSFERS_COUNTER.with_label_values(&["abandoned"]).inc();
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        DELETES_COUNTER.inc();
    }

    pub fn record_delete_deferred(&self) {
        self.deletes_deferred.fetch_add(1, Ordering::Relaxed);
        DELETES_DEFERRED_COUNTER.inc();
    }

    pub fn record_delete_abandoned(&self) {
        DELETES_ABANDONED_COUNTER.inc();
    }

    pub async fn set_rabbitmq_health(&self, healthy: bool) {
        *self.rabbitmq_healthy.write().await = healthy;
        RABBITMQ_HEALTHY_GAUGE.set(if healthy { 1.0 } else { 0.0 });
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let uptime = (Utc::now() - self.start_time).num_seconds().max(0) as u64;
        UPTIME_GAUGE.set(uptime as f64);

        MetricsSnapshot {
            notifications_consumed: self.notifications_consumed.load(Ordering::Relaxed),
            notifications_skipped: self.notifications_skipped.load(Ordering::Relaxed),
            fanout_publishes: self.fanout_publishes.load(Ordering::Relaxed),
            fanout_failures: self.fanout_failures.load(Ordering::Relaxed),
            transfers_succeeded: self.transfers_succeeded.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            deletes_deferred: self.deletes_deferred.load(Ordering::Relaxed),
            rabbitmq_healthy: *self.rabbitmq_healthy.read().await,
            uptime_seconds: uptime,
            start_time: self.start_time,
            last_event_time: *self.last_event_time.read().await,
        }
    }

    pub fn get_prometheus_metrics() -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    #[cfg(test)]
    pub fn reset_for_tests() {
        NOTIFICATIONS_CONSUMED_COUNTER.reset();
        NOTIFICATIONS_SKIPPED_COUNTER.reset();
        NOTIFICATIONS_MALFORMED_COUNTER.reset();
        MESSAGES_ACKED_COUNTER.reset();
        MESSAGES_NACKED_COUNTER.reset();
        FANOUT_PUBLISHES_COUNTER.reset();
        FANOUT_FAILURES_COUNTER.reset();
        TRANSFERS_COUNTER.reset();
        DELETES_COUNTER.reset();
        DELETES_DEFERRED_COUNTER.reset();
        DELETES_ABANDONED_COUNTER.reset();
        // Note: Histogram types don't support reset()
        RABBITMQ_HEALTHY_GAUGE.set(0.0);
        UPTIME_GAUGE.set(0.0);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub notifications_consumed: u64,
    pub notifications_skipped: u64,
    pub fanout_publishes: u64,
    pub fanout_failures: u64,
    pub transfers_succeeded: u64,
    pub transfers_failed: u64,
    pub deletes: u64,
    pub deletes_deferred: u64,
    pub rabbitmq_healthy: bool,
    pub uptime_seconds: u64,
    pub start_time: DateTime<Utc>,
    pub last_event_time: Option<DateTime<Utc>>,
}
