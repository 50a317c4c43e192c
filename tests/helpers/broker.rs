use async_trait::async_trait;
use glance_image_sync::consumer::{Delivery, DeliveryAcker, NotificationPublisher, NotificationSource};
use glance_image_sync::{Result, SyncError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked { requeue: bool },
}

/// Acker that records how its delivery was settled.
#[derive(Clone)]
pub struct RecordingAcker {
    state: Arc<Mutex<AckState>>,
    settle_calls: Arc<Mutex<u32>>,
}

impl RecordingAcker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AckState::Pending)),
            settle_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn state(&self) -> AckState {
        *self.state.lock().unwrap()
    }

    pub fn settle_calls(&self) -> u32 {
        *self.settle_calls.lock().unwrap()
    }

    /// Wrap `body` in a delivery settled through this acker.
    pub fn delivery(&self, body: Vec<u8>, redelivered: bool) -> Delivery {
        let mut delivery = self.delivery_with_content_type(body, Some("application/json"));
        delivery.redelivered = redelivered;
        delivery
    }

    pub fn delivery_with_content_type(&self, body: Vec<u8>, content_type: Option<&str>) -> Delivery {
        Delivery::new(
            body,
            content_type.map(str::to_string),
            false,
            Arc::new(self.clone()),
        )
    }

    fn record(&self, state: AckState) {
        *self.state.lock().unwrap() = state;
        *self.settle_calls.lock().unwrap() += 1;
    }
}

#[async_trait]
impl DeliveryAcker for RecordingAcker {
    async fn ack(&self) -> Result<()> {
        self.record(AckState::Acked);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.record(AckState::Nacked { requeue });
        Ok(())
    }
}

/// Source that yields a fixed list of deliveries and then ends.
pub struct ScriptedSource {
    queue_name: String,
    deliveries: VecDeque<Delivery>,
}

impl ScriptedSource {
    pub fn new(queue_name: &str, deliveries: Vec<Delivery>) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            deliveries: deliveries.into(),
        }
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        self.deliveries.pop_front().map(Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Publisher that keeps every publish in memory, grouped by routing key.
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    declared: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<Published>>>,
    /// Routing key -> number of publishes that fail before one succeeds.
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes to `routing_key` fail.
    pub fn fail_next(&self, routing_key: &str, count: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(routing_key.to_string(), count);
    }

    pub fn declared(&self) -> Vec<String> {
        self.declared.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .map(|p| p.routing_key)
            .collect()
    }

    /// Deliveries queued for `routing_key`, each with its own acker.
    pub fn queue(&self, routing_key: &str) -> Vec<(Delivery, RecordingAcker)> {
        self.published()
            .into_iter()
            .filter(|p| p.routing_key == routing_key)
            .map(|p| {
                let acker = RecordingAcker::new();
                let delivery = Delivery::new(
                    p.body,
                    Some(p.content_type),
                    false,
                    Arc::new(acker.clone()),
                );
                (delivery, acker)
            })
            .collect()
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn ensure_queue(&self, routing_key: &str) -> Result<()> {
        let mut declared = self.declared.lock().unwrap();
        if !declared.iter().any(|k| k == routing_key) {
            declared.push(routing_key.to_string());
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: &[u8], content_type: &str) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(routing_key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::Connection(format!(
                        "Broker rejected publish to '{routing_key}'"
                    )));
                }
            }
        }

        self.published.lock().unwrap().push(Published {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            content_type: content_type.to_string(),
        });
        Ok(())
    }
}
