//! Calendar event entity

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::time::DateTime;

/// Storage-assigned event identity
pub type EventId = i64;

/// Validation failures for an event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The event ends before it starts
    #[error("event ends ({end}) before it starts ({start})")]
    EndBeforeStart { start: DateTime, end: DateTime },
}

/// One calendar entry and its reminder settings
///
/// `notified_at` is `Some` once the reminder has been queued. The
/// transition from `None` to `Some` happens at most once per event;
/// storage backends never clear it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start: DateTime,
    pub end: DateTime,
    /// Whether a reminder should be sent at all
    pub notifying_enabled: bool,
    /// Minutes before `start` at which the reminder is due
    pub before_minutes: u32,
    pub notified_at: Option<DateTime>,
}

impl Event {
    /// Create an event without a reminder; the id is assigned by storage
    pub fn new(name: impl Into<String>, start: DateTime, end: DateTime) -> Self {
        Self {
            id: 0,
            name: name.into(),
            start,
            end,
            notifying_enabled: false,
            before_minutes: 0,
            notified_at: None,
        }
    }

    /// Enable a reminder `before_minutes` ahead of the start
    pub fn with_reminder(mut self, before_minutes: u32) -> Self {
        self.notifying_enabled = true;
        self.before_minutes = before_minutes;
        self
    }

    /// The instant at which the reminder becomes due
    pub fn notify_time(&self) -> DateTime {
        self.start - chrono::Duration::minutes(i64::from(self.before_minutes))
    }

    pub fn is_notified(&self) -> bool {
        self.notified_at.is_some()
    }

    /// Whether this event still needs a reminder inside `[from, to]`
    ///
    /// Missing bounds are unbounded; both bounds are inclusive.
    pub fn needs_notification_within(&self, from: Option<DateTime>, to: Option<DateTime>) -> bool {
        if !self.notifying_enabled || self.is_notified() {
            return false;
        }
        let at = self.notify_time();
        from.map_or(true, |from| at >= from) && to.map_or(true, |to| at <= to)
    }

    /// Check the invariants storage enforces on write
    pub fn validate(&self) -> Result<(), EventError> {
        if self.end < self.start {
            return Err(EventError::EndBeforeStart {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Calendar order: by start, then end, then id
    pub fn schedule_cmp(&self, other: &Self) -> Ordering {
        (self.start, self.end, self.id).cmp(&(other.start, other.end, other.id))
    }
}
