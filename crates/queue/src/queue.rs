//! Queue trait definition

use std::pin::Pin;

use async_trait::async_trait;
use calendar_core::{Event, NotificationPayload};
use futures::Stream;

/// Stream of payloads handed to the single consumer
///
/// Items are `Err` when a message could not be received or decoded; the
/// stream keeps going after such an item and ends once the queue is closed.
pub type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<NotificationPayload, QueueError>> + Send>>;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was closed
    #[error("queue is closed")]
    Closed,

    /// A consumer is already attached
    #[error("queue already has a consumer")]
    AlreadyConsuming,

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Queue name cannot be used as a notification channel
    #[error("invalid queue name: {0}")]
    InvalidName(String),

    /// Connection or broker error
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// One-producer, one-consumer conduit of reminder payloads
///
/// The producer and the consumer may live on different tasks (in-memory)
/// or in different processes (PostgreSQL).
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Enqueue the payload for `event`
    ///
    /// May wait for room in a bounded buffer. Fails with
    /// [`QueueError::Closed`] once the queue is closed, including while waiting.
    async fn push(&self, event: &Event) -> Result<(), QueueError>;

    /// Attach the single consumer
    ///
    /// A second call fails with [`QueueError::AlreadyConsuming`].
    async fn consume(&self) -> Result<NotificationStream, QueueError>;

    /// Close the producer side; open streams end
    ///
    /// Closing twice is accepted.
    async fn close(&self) -> Result<(), QueueError>;
}
