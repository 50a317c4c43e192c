use lapin::{Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::routing::{central_routing_key, node_routing_key, short_hostname};
use crate::config::{Config, RunMode};
use crate::consumer::{RabbitMQConsumer, RabbitMQPublisher};
use crate::error::{Result, SyncError};
use crate::monitoring::{LoopStats, Metrics, PipelineHealth};
use crate::relay::Duplicator;
use crate::sync::{RsyncTransfer, SyncWorker};

/// Owns the broker connection and runs the loops selected by [`RunMode`].
pub struct ImageSyncPipeline {
    config: Config,
    mode: RunMode,
    connection: Connection,
    pub metrics: Arc<Metrics>,
    is_running: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl ImageSyncPipeline {
    /// Connect to the broker. Failing here is fatal for the process.
    pub async fn connect(config: Config, mode: RunMode) -> Result<Self> {
        info!("Initializing image sync pipeline ({})", mode.as_str());

        let uri = config.broker_uri()?;
        info!(
            "Connecting to RabbitMQ at {}:{} (vhost '{}')",
            uri.authority.host, uri.authority.port, uri.vhost
        );
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to connect to RabbitMQ: {e}")))?;

        let metrics = Arc::new(Metrics::new());
        metrics.set_rabbitmq_health(true).await;

        Ok(Self {
            config,
            mode,
            connection,
            metrics,
            is_running: Arc::new(AtomicBool::new(false)),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Run the selected loops until they end or [`stop`](Self::stop) is
    /// called. In `both` mode the loops run concurrently and an error in one
    /// stops the other.
    pub async fn start(&self) -> Result<LoopStats> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Processing("Pipeline is already running".to_string()));
        }

        let duplicator = async {
            if !self.mode.runs_duplicator() {
                return Ok(LoopStats::default());
            }
            let result = self.run_duplicator().await;
            if result.is_err() {
                self.cancellation_token.cancel();
            }
            result
        };

        let sync_worker = async {
            if !self.mode.runs_sync_worker() {
                return Ok(LoopStats::default());
            }
            let result = self.run_sync_worker().await;
            if result.is_err() {
                self.cancellation_token.cancel();
            }
            result
        };

        let (duplicator_result, sync_result) = tokio::join!(duplicator, sync_worker);
        self.is_running.store(false, Ordering::SeqCst);

        if duplicator_result.is_err() || sync_result.is_err() {
            self.metrics.set_rabbitmq_health(false).await;
        }

        if let Err(e) = self.connection.close(200, "Shutting down").await {
            warn!("Error closing RabbitMQ connection: {}", e);
        }

        let mut stats = duplicator_result?;
        stats.merge(&sync_result?);
        info!("Pipeline stopped");
        Ok(stats)
    }

    pub fn stop(&self) {
        info!("Stopping image sync pipeline");
        self.cancellation_token.cancel();
    }

    pub async fn health(&self) -> PipelineHealth {
        let snapshot = self.metrics.get_snapshot().await;
        let connected = self.connection.status().connected();
        PipelineHealth {
            healthy: snapshot.rabbitmq_healthy && connected,
            rabbitmq_healthy: snapshot.rabbitmq_healthy && connected,
            running: self.is_running.load(Ordering::SeqCst),
            mode: self.mode.as_str().to_string(),
            last_check: chrono::Utc::now(),
            last_event_time: snapshot.last_event_time,
        }
    }

    async fn run_duplicator(&self) -> Result<LoopStats> {
        let publisher = RabbitMQPublisher::new(&self.connection, &self.config.exchange).await?;
        let mut consumer = RabbitMQConsumer::new(
            &self.connection,
            &self.config.exchange,
            &central_routing_key(&self.config.topic),
            &format!("{}_duplicator", self.config.relay_prefix),
            self.config.prefetch_count,
        )
        .await?;

        let duplicator = Duplicator::from_config(&self.config, publisher, self.metrics.clone());
        duplicator
            .run(&mut consumer, self.cancellation_token.clone())
            .await
            .map_err(|e| {
                error!("Duplicator failed: {}", e);
                e
            })
    }

    async fn run_sync_worker(&self) -> Result<LoopStats> {
        let mut consumer = RabbitMQConsumer::new(
            &self.connection,
            &self.config.exchange,
            &node_routing_key(&self.config.relay_prefix, &self.config.hostname),
            &format!(
                "{}_{}",
                self.config.relay_prefix,
                short_hostname(&self.config.hostname)
            ),
            self.config.prefetch_count,
        )
        .await?;

        let worker = SyncWorker::from_config(&self.config, RsyncTransfer::new(), self.metrics.clone());
        worker
            .run(&mut consumer, self.cancellation_token.clone())
            .await
            .map_err(|e| {
                error!("Sync worker failed: {}", e);
                e
            })
    }
}
