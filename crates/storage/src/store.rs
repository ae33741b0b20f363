//! Storage trait definition

use std::time::Duration;

use async_trait::async_trait;
use calendar_core::{DateTime, Event, EventError, EventId};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// Event rejected by validation
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    /// Call exceeded the per-call deadline
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("migration error: {0}")]
    Migration(String),
}

/// Store for calendar events
///
/// Implementations must be thread-safe: the scheduler scans while
/// request handlers add and edit other events.
///
/// Listing operations return events ordered by `(start, end, id)`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Event CRUD
    // =========================================================================

    /// Store a new event and return its freshly assigned id
    ///
    /// The id carried by `event` is ignored.
    async fn add_event(&self, event: Event) -> Result<EventId, StorageError>;

    /// Replace an event's name, times and reminder settings
    ///
    /// Notification state is kept: an already notified event stays notified.
    async fn update_event(&self, id: EventId, event: Event) -> Result<(), StorageError>;

    /// Remove an event
    async fn delete_event(&self, id: EventId) -> Result<(), StorageError>;

    /// Get one event
    async fn get_event(&self, id: EventId) -> Result<Event, StorageError>;

    /// Get every event
    async fn get_all_events(&self) -> Result<Vec<Event>, StorageError>;

    /// Events starting within `[from, to]`
    async fn get_events_by_period(
        &self,
        from: DateTime,
        to: DateTime,
    ) -> Result<Vec<Event>, StorageError>;

    // =========================================================================
    // Reminder Operations
    // =========================================================================

    /// Events with an enabled, not yet sent reminder due within `[from, to]`
    ///
    /// A `None` bound is unbounded on that side. Both bounds are inclusive.
    async fn get_events_to_notify(
        &self,
        from: Option<DateTime>,
        to: Option<DateTime>,
    ) -> Result<Vec<Event>, StorageError>;

    /// Record that the reminder for `id` was queued at `when`
    ///
    /// Marking twice is accepted; the last timestamp wins.
    async fn mark_event_as_notified(&self, id: EventId, when: DateTime)
        -> Result<(), StorageError>;

    /// Remove events that ended before `cutoff`; returns how many
    async fn delete_events_ended_before(&self, cutoff: DateTime) -> Result<u64, StorageError>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Number of stored events
    async fn count(&self) -> Result<usize, StorageError>;

    /// Remove every event
    async fn clear_all(&self) -> Result<(), StorageError>;
}
