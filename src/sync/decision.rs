use crate::core::routing::short_hostname;
use crate::core::types::{EventType, Notification};
use crate::error::Result;

/// What the sync worker should do with a node-addressed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Copy the image file from the publishing node.
    Pull { image_id: String, publisher: String },
    /// Remove the local copy, unless a transfer is still landing.
    Delete { image_id: String },
    /// Acknowledge without touching the image store.
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// This node published the update and already has the file.
    OwnUpdate,
    /// Creation precedes data availability; the following update carries the work.
    Create,
    Unhandled(EventType),
}

/// True when `publisher` names this node, either verbatim or by short name.
pub fn is_self(publisher: &str, own_hostname: &str) -> bool {
    publisher == own_hostname || short_hostname(publisher) == short_hostname(own_hostname)
}

pub fn decide(notification: &Notification, own_hostname: &str) -> Result<SyncAction> {
    match &notification.event_type {
        EventType::ImageUpdate => {
            let publisher = notification.publisher()?;
            if is_self(publisher, own_hostname) {
                return Ok(SyncAction::Skip(SkipReason::OwnUpdate));
            }
            Ok(SyncAction::Pull {
                image_id: notification.image_id()?.to_string(),
                publisher: publisher.to_string(),
            })
        }
        EventType::ImageDelete => Ok(SyncAction::Delete {
            image_id: notification.image_id()?.to_string(),
        }),
        EventType::ImageCreate => Ok(SyncAction::Skip(SkipReason::Create)),
        other => Ok(SyncAction::Skip(SkipReason::Unhandled(other.clone()))),
    }
}
