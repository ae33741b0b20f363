//! In-memory implementation of Storage

use std::collections::HashMap;

use async_trait::async_trait;
use calendar_core::{DateTime, Event, EventId};
use parking_lot::RwLock;

use super::store::*;

struct Inner {
    events: HashMap<EventId, Event>,
    next_id: EventId,
}

/// In-memory implementation of Storage
///
/// Used for development and tests. One read/write lock guards all data:
/// queries take the shared lock, mutations the exclusive one. It provides
/// the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use calendar_storage::InMemoryStorage;
///
/// let storage = InMemoryStorage::new();
/// ```
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    /// Create an empty store; the first id handed out is 1
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                events: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn sorted(mut events: Vec<Event>) -> Vec<Event> {
        events.sort_by(Event::schedule_cmp);
        events
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn add_event(&self, mut event: Event) -> Result<EventId, StorageError> {
        event.validate()?;

        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        event.id = id;
        inner.events.insert(id, event);
        Ok(id)
    }

    async fn update_event(&self, id: EventId, event: Event) -> Result<(), StorageError> {
        event.validate()?;

        let mut inner = self.inner.write();
        let stored = inner
            .events
            .get_mut(&id)
            .ok_or(StorageError::EventNotFound(id))?;

        stored.name = event.name;
        stored.start = event.start;
        stored.end = event.end;
        stored.notifying_enabled = event.notifying_enabled;
        stored.before_minutes = event.before_minutes;
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<(), StorageError> {
        self.inner
            .write()
            .events
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::EventNotFound(id))
    }

    async fn get_event(&self, id: EventId) -> Result<Event, StorageError> {
        self.inner
            .read()
            .events
            .get(&id)
            .cloned()
            .ok_or(StorageError::EventNotFound(id))
    }

    async fn get_all_events(&self) -> Result<Vec<Event>, StorageError> {
        let events = self.inner.read().events.values().cloned().collect();
        Ok(Self::sorted(events))
    }

    async fn get_events_by_period(
        &self,
        from: DateTime,
        to: DateTime,
    ) -> Result<Vec<Event>, StorageError> {
        let events = self
            .inner
            .read()
            .events
            .values()
            .filter(|e| e.start >= from && e.start <= to)
            .cloned()
            .collect();
        Ok(Self::sorted(events))
    }

    async fn get_events_to_notify(
        &self,
        from: Option<DateTime>,
        to: Option<DateTime>,
    ) -> Result<Vec<Event>, StorageError> {
        let events = self
            .inner
            .read()
            .events
            .values()
            .filter(|e| e.needs_notification_within(from, to))
            .cloned()
            .collect();
        Ok(Self::sorted(events))
    }

    async fn mark_event_as_notified(
        &self,
        id: EventId,
        when: DateTime,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let event = inner
            .events
            .get_mut(&id)
            .ok_or(StorageError::EventNotFound(id))?;
        event.notified_at = Some(when);
        Ok(())
    }

    async fn delete_events_ended_before(&self, cutoff: DateTime) -> Result<u64, StorageError> {
        let mut inner = self.inner.write();
        let before = inner.events.len();
        inner.events.retain(|_, e| e.end >= cutoff);
        Ok((before - inner.events.len()) as u64)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.inner.read().events.len())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.inner.write().events.clear();
        Ok(())
    }
}
