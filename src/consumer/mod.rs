//! Message stream abstraction over the broker.
//!
//! The relay loops only see [`NotificationSource`] and
//! [`NotificationPublisher`]; the RabbitMQ implementations live in the
//! submodules.

pub mod rabbitmq_consumer;
pub mod rabbitmq_publisher;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::core::types::Notification;
use crate::error::Result;

pub use rabbitmq_consumer::RabbitMQConsumer;
pub use rabbitmq_publisher::RabbitMQPublisher;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message received from a queue, not yet acknowledged.
#[derive(Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub redelivered: bool,
    acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        content_type: Option<String>,
        redelivered: bool,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            body,
            content_type,
            redelivered,
            acker,
        }
    }

    pub fn notification(&self) -> Result<Notification> {
        Notification::from_slice(&self.body)
    }

    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("content_type", &self.content_type)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Ordered stream of deliveries from one queue.
#[async_trait]
pub trait NotificationSource: Send {
    /// Name of the queue being consumed, for logs and metrics.
    fn queue_name(&self) -> &str;

    /// Wait for the next delivery. `None` means the stream has ended.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}

/// Publishes copies of notifications to node-addressed queues.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Declare the queue for `routing_key` if it does not exist yet.
    async fn ensure_queue(&self, routing_key: &str) -> Result<()>;

    async fn publish(&self, routing_key: &str, body: &[u8], content_type: &str) -> Result<()>;
}

/// How a delivery was settled by one of the loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected,
}

/// Ack or nack `delivery`, returning what was done.
pub async fn settle(delivery: &Delivery, settlement: Settlement) -> Result<Settlement> {
    match settlement {
        Settlement::Acked => delivery.ack().await?,
        Settlement::Requeued => delivery.nack(true).await?,
        Settlement::Rejected => delivery.nack(false).await?,
    }
    Ok(settlement)
}
