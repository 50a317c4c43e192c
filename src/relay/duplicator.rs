use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FanoutFailurePolicy};
use crate::consumer::{settle, Delivery, NotificationPublisher, NotificationSource, Settlement};
use crate::core::nodes::NodeList;
use crate::core::retry::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::monitoring::{LoopStats, Metrics};

pub const ROLE: &str = "duplicator";

/// Result of republishing one notification to every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<String>,
    /// `(node, error)` for every node whose publish failed after retries.
    pub failed: Vec<(String, String)>,
}

impl FanoutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        self.failed.iter().map(|(node, _)| node.clone()).collect()
    }
}

/// Fans the central notification stream out into one queue per node.
pub struct Duplicator<P> {
    publisher: P,
    nodes: NodeList,
    relay_prefix: String,
    publish_retry: RetryPolicy,
    failure_policy: FanoutFailurePolicy,
    metrics: Arc<Metrics>,
}

impl<P: NotificationPublisher> Duplicator<P> {
    pub fn new(
        publisher: P,
        nodes: NodeList,
        relay_prefix: impl Into<String>,
        publish_retry: RetryPolicy,
        failure_policy: FanoutFailurePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            publisher,
            nodes,
            relay_prefix: relay_prefix.into(),
            publish_retry,
            failure_policy,
            metrics,
        }
    }

    pub fn from_config(config: &Config, publisher: P, metrics: Arc<Metrics>) -> Self {
        Self::new(
            publisher,
            config.api_nodes.clone(),
            config.relay_prefix.clone(),
            config.publish_retry(),
            config.fanout_failure_policy,
            metrics,
        )
    }

    /// Consume `source` until it ends or `cancellation_token` fires.
    pub async fn run<S>(&self, source: &mut S, cancellation_token: CancellationToken) -> Result<LoopStats>
    where
        S: NotificationSource + ?Sized,
    {
        let queue = source.queue_name().to_string();
        info!(
            "Duplicating notifications from '{}' to {} nodes",
            queue,
            self.nodes.len()
        );

        let mut stats = LoopStats::default();

        loop {
            let next = tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    info!("Duplicator received shutdown signal");
                    break;
                }
                next = source.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("Duplicator stream error on '{}': {}", queue, e);
                    return Err(e);
                }
                None => {
                    info!("Duplicator stream on '{}' ended", queue);
                    break;
                }
            };

            self.metrics.record_notification_consumed(ROLE).await;
            stats.processed += 1;

            let (settlement, relayed) = self.handle_delivery(&queue, &delivery).await?;
            match settlement {
                Settlement::Acked => stats.acked += 1,
                Settlement::Requeued => stats.requeued += 1,
                Settlement::Rejected => stats.rejected += 1,
            }
            if !relayed && settlement == Settlement::Acked {
                stats.skipped += 1;
            }
        }

        info!(
            "Duplicator stopped: {} processed, {} acked, {} requeued, {} rejected, {} skipped",
            stats.processed, stats.acked, stats.requeued, stats.rejected, stats.skipped
        );
        Ok(stats)
    }

    /// Filter, fan out and settle one delivery. Returns the settlement and
    /// whether the notification was relayed at all.
    ///
    /// Errors when the broker fails, including a fan-out that reached no
    /// node at all; the delivery is requeued first.
    pub async fn handle_delivery(&self, queue: &str, delivery: &Delivery) -> Result<(Settlement, bool)> {
        let (settlement, relayed) = match delivery.notification() {
            Err(e) => {
                error!("Rejecting notification on '{}': {}", queue, e);
                self.metrics.record_notification_malformed(ROLE);
                (Settlement::Rejected, false)
            }
            Ok(notification) if !notification.event_type.is_relayed() => {
                debug!("Skipping {} notification", notification.event_type);
                self.metrics
                    .record_notification_skipped(ROLE, notification.event_type.metric_label());
                (Settlement::Acked, false)
            }
            Ok(notification) => {
                let report = self.fan_out(delivery).await;
                let image_id = notification.payload.id.as_deref().unwrap_or("-");
                let publisher = notification.publisher_id.as_deref().unwrap_or("-");

                info!(
                    event_type = %notification.event_type,
                    image_id,
                    publisher,
                    "{} {} {}",
                    notification.event_type,
                    image_id,
                    publisher
                );

                if report.delivered.is_empty() && !report.failed.is_empty() {
                    // Nothing reached any node: the broker side is broken, not
                    // one node. Keep the message and stop the loop.
                    let err = SyncError::PartialFanout(report.failed_nodes());
                    error!("{}; stopping duplicator", err);
                    settle(delivery, Settlement::Requeued).await?;
                    self.metrics.record_message_nacked(queue, true);
                    return Err(err);
                }

                (self.settlement_for(&report, delivery.redelivered), true)
            }
        };

        settle(delivery, settlement).await?;
        match settlement {
            Settlement::Acked => self.metrics.record_message_acked(queue),
            Settlement::Requeued => self.metrics.record_message_nacked(queue, true),
            Settlement::Rejected => self.metrics.record_message_nacked(queue, false),
        }

        Ok((settlement, relayed))
    }

    /// Republish `delivery` to every node in list order, one node at a time.
    /// A node that still fails after retries does not stop the others.
    pub async fn fan_out(&self, delivery: &Delivery) -> FanoutReport {
        let start_time = Instant::now();
        let mut report = FanoutReport::default();
        let content_type = delivery.content_type_or_default();

        for (node, routing_key) in self.nodes.routing_keys(&self.relay_prefix) {
            match self
                .publish_to_node(&routing_key, &delivery.body, content_type)
                .await
            {
                Ok(()) => {
                    debug!("Relayed notification to {} via '{}'", node, routing_key);
                    self.metrics.record_fanout_publish(&node);
                    report.delivered.push(node);
                }
                Err(e) => {
                    warn!("Failed to relay notification to {}: {}", node, e);
                    self.metrics.record_fanout_failure(&node);
                    report.failed.push((node, e.to_string()));
                }
            }
        }

        self.metrics.record_fanout_duration(start_time.elapsed());
        report
    }

    async fn publish_to_node(&self, routing_key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let publisher = &self.publisher;
        self.publish_retry
            .run("Node publish", move |_| async move {
                publisher.ensure_queue(routing_key).await?;
                publisher.publish(routing_key, body, content_type).await
            })
            .await
    }

    fn settlement_for(&self, report: &FanoutReport, redelivered: bool) -> Settlement {
        if report.is_complete() {
            return Settlement::Acked;
        }

        let err = SyncError::PartialFanout(report.failed_nodes());
        match self.failure_policy {
            FanoutFailurePolicy::Requeue if !redelivered => {
                warn!("{}; requeueing for another fan-out", err);
                Settlement::Requeued
            }
            FanoutFailurePolicy::Requeue => {
                error!("{} again after redelivery; acknowledging", err);
                Settlement::Acked
            }
            FanoutFailurePolicy::Ack => {
                error!("{}; acknowledging anyway", err);
                Settlement::Acked
            }
        }
    }
}
