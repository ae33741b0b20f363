//! In-memory implementation of Queue

use async_trait::async_trait;
use calendar_core::{Event, NotificationPayload};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::queue::*;

/// Default buffer size
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded channel between tasks of one process
///
/// `push` waits while the buffer is full. Closing wakes waiting pushes with
/// [`QueueError::Closed`] and lets the consumer drain what is already
/// buffered before its stream ends.
///
/// # Example
///
/// ```
/// use calendar_queue::InMemoryQueue;
///
/// let queue = InMemoryQueue::new(16);
/// ```
pub struct InMemoryQueue {
    sender: Mutex<Option<mpsc::Sender<NotificationPayload>>>,
    receiver: Mutex<Option<mpsc::Receiver<NotificationPayload>>>,
    closed: watch::Sender<bool>,
}

impl InMemoryQueue {
    /// Create a queue holding at most `capacity` undelivered payloads
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            closed,
        }
    }

    /// Check whether `close` was called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn push(&self, event: &Event) -> Result<(), QueueError> {
        let sender = self.sender.lock().clone().ok_or(QueueError::Closed)?;
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(QueueError::Closed);
        }

        let payload = NotificationPayload::from(event);
        tokio::select! {
            result = sender.send(payload) => {
                result.map_err(|_| QueueError::Closed)?;
                debug!(event_id = event.id, "queued notification");
                Ok(())
            }
            _ = closed_rx.changed() => Err(QueueError::Closed),
        }
    }

    async fn consume(&self) -> Result<NotificationStream, QueueError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(QueueError::AlreadyConsuming)?;

        Ok(Box::pin(ReceiverStream::new(receiver).map(Ok::<_, QueueError>)))
    }

    async fn close(&self) -> Result<(), QueueError> {
        // Dropping the stored sender ends the stream once pending pushes let go of theirs
        self.sender.lock().take();
        self.closed.send_replace(true);
        Ok(())
    }
}
