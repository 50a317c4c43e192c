use async_trait::async_trait;
use lapin::{options::*, types::ShortString, BasicProperties, Channel, Connection};
use tracing::{debug, info};

use super::rabbitmq_consumer::{declare_bound_queue, declare_exchange};
use super::NotificationPublisher;
use crate::error::{Result, SyncError};

/// Publishes relayed notifications to node queues on the notification
/// exchange. The channel runs in confirm mode so a broker-side rejection
/// surfaces as a publish error.
pub struct RabbitMQPublisher {
    channel: Channel,
    exchange: String,
}

impl RabbitMQPublisher {
    pub async fn new(connection: &Connection, exchange: &str) -> Result<Self> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to create channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to enable publisher confirms: {e}")))?;

        declare_exchange(&channel, exchange).await?;

        info!("Publisher ready on exchange '{}'", exchange);

        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl NotificationPublisher for RabbitMQPublisher {
    async fn ensure_queue(&self, routing_key: &str) -> Result<()> {
        declare_bound_queue(&self.channel, &self.exchange, routing_key).await
    }

    async fn publish(&self, routing_key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let properties =
            BasicProperties::default().with_content_type(ShortString::from(content_type.to_string()));

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to publish message: {e}")))?
            .await
            .map_err(|e| SyncError::Connection(format!("Failed to confirm publish: {e}")))?;

        if confirmation.is_nack() {
            return Err(SyncError::Connection(format!(
                "Broker rejected publish to '{routing_key}'"
            )));
        }

        debug!(
            "Published {} bytes to exchange '{}' with routing key '{}'",
            body.len(),
            self.exchange,
            routing_key
        );
        Ok(())
    }
}
