use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::decision::{decide, SkipReason, SyncAction};
use super::image_store::ImageStore;
use super::transfer::{FileTransfer, TransferRequest};
use crate::config::Config;
use crate::consumer::{settle, Delivery, NotificationSource, Settlement};
use crate::core::retry::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::monitoring::{LoopStats, Metrics};

pub const ROLE: &str = "sync_worker";

#[derive(Debug, Clone)]
pub struct SyncWorkerSettings {
    pub hostname: String,
    pub rsync_user: String,
    pub transfer_retry: RetryPolicy,
    /// How many times an in-flight marker is re-checked before the delete
    /// goes back to the broker.
    pub delete_recheck_attempts: u32,
    pub delete_recheck_interval: Duration,
    pub in_flight_marker_max_age: Duration,
}

impl SyncWorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.hostname.clone(),
            rsync_user: config.rsync_user.clone(),
            transfer_retry: config.transfer_retry(),
            delete_recheck_attempts: config.delete_recheck_attempts,
            delete_recheck_interval: config.delete_recheck_interval(),
            in_flight_marker_max_age: config.in_flight_marker_max_age(),
        }
    }
}

/// Applies node-addressed notifications to the local image store.
///
/// One delivery is handled to completion (including a blocking transfer)
/// before the next one is received.
pub struct SyncWorker<T> {
    store: ImageStore,
    transfer: T,
    settings: SyncWorkerSettings,
    metrics: Arc<Metrics>,
}

impl<T: FileTransfer> SyncWorker<T> {
    pub fn new(
        store: ImageStore,
        transfer: T,
        settings: SyncWorkerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            transfer,
            settings,
            metrics,
        }
    }

    pub fn from_config(config: &Config, transfer: T, metrics: Arc<Metrics>) -> Self {
        Self::new(
            ImageStore::new(&config.datadir),
            transfer,
            SyncWorkerSettings::from_config(config),
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
            "Sync worker for {} consuming from '{}' into {}",
            self.settings.hostname,
            queue,
            self.store.datadir().display()
        );

        let mut stats = LoopStats::default();

        loop {
            let next = tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    info!("Sync worker received shutdown signal");
                    break;
                }
                next = source.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("Sync worker stream error on '{}': {}", queue, e);
                    return Err(e);
                }
                None => {
                    info!("Sync worker stream on '{}' ended", queue);
                    break;
                }
            };

            self.metrics.record_notification_consumed(ROLE).await;
            stats.processed += 1;

            let (settlement, skipped) = self.handle_delivery(&queue, &delivery).await?;
            match settlement {
                Settlement::Acked => stats.acked += 1,
                Settlement::Requeued => stats.requeued += 1,
                Settlement::Rejected => stats.rejected += 1,
            }
            if skipped {
                stats.skipped += 1;
            }
        }

        info!(
            "Sync worker stopped: {} processed, {} acked, {} requeued, {} rejected",
            stats.processed, stats.acked, stats.requeued, stats.rejected
        );
        Ok(stats)
    }

    /// Act on one delivery and settle it with the broker. Returns the
    /// settlement and whether the notification needed no action.
    ///
    /// Only a failure to talk to the broker is returned as an error.
    pub async fn handle_delivery(&self, queue: &str, delivery: &Delivery) -> Result<(Settlement, bool)> {
        let (settlement, skipped) = match self.process(delivery).await {
            Ok(SyncOutcome::Skipped) => (Settlement::Acked, true),
            Ok(SyncOutcome::Settle(settlement)) => (settlement, false),
            Err(e) => {
                error!("Rejecting notification on '{}': {}", queue, e);
                self.metrics.record_notification_malformed(ROLE);
                (Settlement::Rejected, false)
            }
        };

        settle(delivery, settlement).await?;
        match settlement {
            Settlement::Acked => self.metrics.record_message_acked(queue),
            Settlement::Requeued => self.metrics.record_message_nacked(queue, true),
            Settlement::Rejected => self.metrics.record_message_nacked(queue, false),
        }

        Ok((settlement, skipped))
    }

    async fn process(&self, delivery: &Delivery) -> Result<SyncOutcome> {
        let notification = delivery.notification()?;

        match decide(&notification, &self.settings.hostname)? {
            SyncAction::Pull {
                image_id,
                publisher,
            } => Ok(SyncOutcome::Settle(
                self.pull(&image_id, &publisher, delivery).await?,
            )),
            SyncAction::Delete { image_id } => Ok(SyncOutcome::Settle(
                self.delete(&image_id, delivery).await?,
            )),
            SyncAction::Skip(reason) => {
                match &reason {
                    SkipReason::OwnUpdate => debug!(
                        "Skipping update of {} published by this node",
                        notification.payload.id.as_deref().unwrap_or("-")
                    ),
                    SkipReason::Create => debug!(
                        "Skipping create of {}; waiting for its update",
                        notification.payload.id.as_deref().unwrap_or("-")
                    ),
                    SkipReason::Unhandled(event_type) => {
                        debug!("Ignoring {} notification", event_type)
                    }
                }
                self.metrics
                    .record_notification_skipped(ROLE, notification.event_type.metric_label());
                Ok(SyncOutcome::Skipped)
            }
        }
    }

    async fn pull(&self, image_id: &str, publisher: &str, delivery: &Delivery) -> Result<Settlement> {
        let path = self.store.image_path(image_id)?;
        info!(image_id, publisher, "Update detected on {} ...", path.display());

        let request = TransferRequest {
            user: self.settings.rsync_user.clone(),
            host: publisher.to_string(),
            source: path.clone(),
            destination: path,
        };

        let request = &request;
        let transfer = &self.transfer;
        let metrics = &self.metrics;
        let result = self
            .settings
            .transfer_retry
            .run("Image transfer", move |_| async move {
                let start_time = Instant::now();
                let outcome = transfer.transfer(request).await?;
                metrics.record_transfer(outcome.success, start_time.elapsed());
                outcome.into_result()
            })
            .await;

        match result {
            Ok(()) => {
                info!(image_id, "Copied {} from {}", request.destination.display(), publisher);
                Ok(Settlement::Acked)
            }
            Err(e) => {
                let settlement = self.settle_failure(delivery, "transfer", image_id, &e);
                if settlement == Settlement::Acked {
                    self.metrics.record_transfer_abandoned();
                }
                Ok(settlement)
            }
        }
    }

    async fn delete(&self, image_id: &str, delivery: &Delivery) -> Result<Settlement> {
        let path = self.store.image_path(image_id)?;
        info!(image_id, "Delete detected on {} ...", path.display());

        let mut rechecks = 0;
        let stale = loop {
            match self
                .store
                .in_flight_markers(image_id, self.settings.in_flight_marker_max_age)
                .await
            {
                Ok(markers) if !markers.in_flight() => break markers.stale,
                Ok(_) if rechecks < self.settings.delete_recheck_attempts => {
                    rechecks += 1;
                    debug!(
                        "Transfer of {} in flight; re-checking in {:?} ({}/{})",
                        image_id,
                        self.settings.delete_recheck_interval,
                        rechecks,
                        self.settings.delete_recheck_attempts
                    );
                    tokio::time::sleep(self.settings.delete_recheck_interval).await;
                }
                Ok(_) => return Ok(self.defer_delete(delivery, image_id, &path)),
                Err(e) => return Ok(self.settle_failure(delivery, "in-flight check", image_id, &e)),
            }
        };

        if !stale.is_empty() {
            warn!(
                image_id,
                "Removing {} stale in-flight marker(s) left by an interrupted copy",
                stale.len()
            );
            if let Err(e) = self.store.remove_markers(&stale).await {
                return Ok(self.settle_failure(delivery, "stale marker cleanup", image_id, &e));
            }
        }

        match self.store.delete(image_id).await {
            Ok(removed) => {
                if removed {
                    info!(image_id, "Removed {}", path.display());
                } else {
                    debug!("{} was already absent", path.display());
                }
                self.metrics.record_delete();
                Ok(Settlement::Acked)
            }
            Err(e) => Ok(self.settle_failure(delivery, "delete", image_id, &e)),
        }
    }

    /// A copy is still being written. The first delivery goes back to the
    /// broker; a redelivery that still finds a live copy is dropped so the
    /// queue behind it keeps moving.
    fn defer_delete(&self, delivery: &Delivery, image_id: &str, path: &Path) -> Settlement {
        if delivery.redelivered {
            error!(
                image_id,
                "Transfer still in flight for {} after redelivery; abandoning delete",
                path.display()
            );
            self.metrics.record_delete_abandoned();
            Settlement::Acked
        } else {
            warn!(
                image_id,
                "Transfer still in flight for {}; leaving delete for redelivery",
                path.display()
            );
            self.metrics.record_delete_deferred();
            Settlement::Requeued
        }
    }

    /// A first failure goes back to the broker once; a failure on a
    /// redelivered message is abandoned and acknowledged.
    fn settle_failure(
        &self,
        delivery: &Delivery,
        action: &str,
        image_id: &str,
        err: &SyncError,
    ) -> Settlement {
        if delivery.redelivered {
            error!(
                image_id,
                "Abandoning {} after redelivery: {}", action, err
            );
            Settlement::Acked
        } else {
            warn!(
                image_id,
                "{} failed: {}; requeueing for one more attempt", action, err
            );
            Settlement::Requeued
        }
    }
}

enum SyncOutcome {
    Skipped,
    Settle(Settlement),
}
