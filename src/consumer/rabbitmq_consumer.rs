use async_trait::async_trait;
use futures::StreamExt;
use lapin::{acker::Acker, options::*, types::FieldTable, Channel, Connection, Consumer};
use tracing::{debug, info, warn};

use super::{Delivery, DeliveryAcker, NotificationSource};
use crate::error::{Result, SyncError};

/// Declare the notification exchange on `channel`.
///
/// Topic exchange, non-durable, matching how the image service declares it;
/// a mismatch makes the broker refuse the declaration.
pub async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            lapin::ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| SyncError::Connection(format!("Failed to declare exchange {exchange}: {e}")))
}

/// Declare a queue named after `routing_key` and bind it to `exchange`.
pub async fn declare_bound_queue(channel: &Channel, exchange: &str, routing_key: &str) -> Result<()> {
    channel
        .queue_declare(
            routing_key,
            QueueDeclareOptions {
                durable: false,
                exclusive: false,
                auto_delete: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| SyncError::Connection(format!("Failed to declare queue {routing_key}: {e}")))?;

    channel
        .queue_bind(
            routing_key,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            SyncError::Connection(format!(
                "Failed to bind queue {routing_key} to exchange {exchange}: {e}"
            ))
        })?;

    Ok(())
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to acknowledge message: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to nack message: {e}")))
    }
}

/// Consumes one routing-key queue with manual acknowledgement.
pub struct RabbitMQConsumer {
    _channel: Channel,
    consumer: Consumer,
    queue_name: String,
}

impl RabbitMQConsumer {
    pub async fn new(
        connection: &Connection,
        exchange: &str,
        routing_key: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<Self> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to create channel: {e}")))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to set prefetch count: {e}")))?;

        declare_exchange(&channel, exchange).await?;
        declare_bound_queue(&channel, exchange, routing_key).await?;

        let consumer = channel
            .basic_consume(
                routing_key,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SyncError::Connection(format!(
                    "Failed to start consumer for queue {routing_key}: {e}"
                ))
            })?;

        info!(
            "Consumer '{}' started on queue '{}' bound to exchange '{}'",
            consumer_tag, routing_key, exchange
        );

        Ok(Self {
            _channel: channel,
            consumer,
            queue_name: routing_key.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSource for RabbitMQConsumer {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => {
                debug!(
                    "Received delivery {} on queue {}",
                    delivery.delivery_tag, self.queue_name
                );
                let content_type = delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|ct| ct.as_str().to_string());
                Some(Ok(Delivery::new(
                    delivery.data,
                    content_type,
                    delivery.redelivered,
                    std::sync::Arc::new(LapinAcker(delivery.acker)),
                )))
            }
            Some(Err(e)) => Some(Err(SyncError::Connection(format!(
                "Error receiving message from queue {}: {e}",
                self.queue_name
            )))),
            None => {
                warn!("Consumer stream closed for queue {}", self.queue_name);
                None
            }
        }
    }
}
