//! Queue payload for a due reminder

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId};

/// Flattened projection of an [`Event`] carried through the queue
///
/// Timestamps are kept as text so queue backends and consumers do not
/// depend on the event model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: EventId,
    pub name: String,
    pub start: String,
    pub end: String,
}

impl From<&Event> for NotificationPayload {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            name: event.name.clone(),
            start: event.start.to_string(),
            end: event.end.to_string(),
        }
    }
}

impl NotificationPayload {
    /// Encode for a byte-oriented transport
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    /// Decode from a byte-oriented transport
    pub fn from_json(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
