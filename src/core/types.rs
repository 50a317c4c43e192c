use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncError};

/// Kind of lifecycle notification emitted by the image service.
///
/// Anything the relay does not act on is kept verbatim in `Other` so it can
/// still be logged and counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ImageCreate,
    ImageUpdate,
    ImageDelete,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ImageCreate => "image.create",
            EventType::ImageUpdate => "image.update",
            EventType::ImageDelete => "image.delete",
            EventType::Other(other) => other,
        }
    }

    /// Event kinds that are fanned out to every node.
    pub fn is_relayed(&self) -> bool {
        matches!(self, EventType::ImageUpdate | EventType::ImageDelete)
    }

    /// Bounded label for metrics; unknown kinds collapse into `other`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            EventType::ImageCreate => "image.create",
            EventType::ImageUpdate => "image.update",
            EventType::ImageDelete => "image.delete",
            EventType::Other(_) => "other",
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "image.create" => EventType::ImageCreate,
            "image.update" => EventType::ImageUpdate,
            "image.delete" => EventType::ImageDelete,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub id: Option<String>,
}

/// Image lifecycle notification as published on the notification exchange.
///
/// Only the fields the relay reads are modelled; the original body bytes are
/// what gets republished, so unknown fields survive the fan-out untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Notification {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: ImagePayload,
    #[serde(default)]
    pub publisher_id: Option<String>,
}

impl Notification {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SyncError::ParseError(format!("Failed to parse notification: {e}")))
    }

    pub fn image_id(&self) -> Result<&str> {
        self.payload.id.as_deref().ok_or_else(|| {
            SyncError::ParseError(format!("{} notification without payload.id", self.event_type))
        })
    }

    pub fn publisher(&self) -> Result<&str> {
        self.publisher_id.as_deref().ok_or_else(|| {
            SyncError::ParseError(format!("{} notification without publisher_id", self.event_type))
        })
    }
}
