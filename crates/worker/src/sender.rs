//! Reminder sender
//!
//! Drains the notification queue and hands each payload to a [`Notifier`].
//! Delivery failures are logged and never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use calendar_core::NotificationPayload;
use calendar_queue::{Queue, QueueError};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{Lifecycle, WorkerStatus};

/// Delivery failure
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Delivery channel for reminders (log, email, SMS, ...)
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Records each reminder as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        info!(
            event_id = payload.id,
            name = %payload.name,
            start = %payload.start,
            end = %payload.end,
            "Event reminder"
        );
        Ok(())
    }
}

/// Sender errors
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("queue is not initialized")]
    QueueNotInitialized,

    #[error("sender is already running")]
    AlreadyRunning,

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Queue consumer delivering reminders
pub struct Sender {
    queue: Option<Arc<dyn Queue>>,
    notifier: Arc<dyn Notifier>,
    lifecycle: Lifecycle,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    /// Sender delivering through [`LogNotifier`]
    pub fn new() -> Self {
        Self {
            queue: None,
            notifier: Arc::new(LogNotifier),
            lifecycle: Lifecycle::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn status(&self) -> WorkerStatus {
        self.lifecycle.status()
    }

    pub fn is_running(&self) -> bool {
        self.status() != WorkerStatus::Stopped
    }

    /// Reminders delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Reminders whose delivery failed so far
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Consume the queue until [`Sender::stop`] or until the queue closes
    pub async fn run(&self) -> Result<(), SenderError> {
        let queue = self.queue.clone().ok_or(SenderError::QueueNotInitialized)?;
        let mut shutdown_rx = self.lifecycle.begin().ok_or(SenderError::AlreadyRunning)?;

        let mut stream = match queue.consume().await {
            Ok(stream) => stream,
            Err(e) => {
                self.lifecycle.finish();
                return Err(e.into());
            }
        };
        info!("Sender started");

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(payload)) => self.send(&payload).await,
                    Some(Err(e)) => warn!(error = %e, "Failed to receive reminder"),
                    None => {
                        info!("Queue closed, sender exiting");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    debug!("Sender loop: shutdown requested");
                    break;
                }
            }
        }

        self.lifecycle.finish();
        info!(
            delivered = self.delivered(),
            failed = self.failed(),
            "Sender stopped"
        );
        Ok(())
    }

    /// Ask a running sender to stop; no-op otherwise
    pub fn stop(&self) {
        if self.lifecycle.stop() {
            info!("Sender stop requested");
        }
    }

    /// Deliver one reminder; failures are logged only
    pub async fn send(&self, payload: &NotificationPayload) {
        match self.notifier.notify(payload).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(event_id = payload.id, error = %e, "Failed to deliver reminder");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use calendar_core::{DateTime, Event};
    use calendar_queue::{InMemoryQueue, NotificationStream};
    use parking_lot::Mutex;

    /// Notifier that keeps what it was given and fails on request
    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<NotificationPayload>>,
        fail_on: Option<String>,
    }

    impl RecordingNotifier {
        fn names(&self) -> Vec<String> {
            self.seen.lock().iter().map(|p| p.name.clone()).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
            self.seen.lock().push(payload.clone());
            if self.fail_on.as_deref() == Some(payload.name.as_str()) {
                return Err(NotifyError::Delivery("smtp refused".to_string()));
            }
            Ok(())
        }
    }

    /// Queue yielding a fixed list of items, then ending
    struct ScriptedQueue(Mutex<Option<Vec<Result<NotificationPayload, QueueError>>>>);

    #[async_trait]
    impl Queue for ScriptedQueue {
        async fn push(&self, _event: &Event) -> Result<(), QueueError> {
            Err(QueueError::Closed)
        }

        async fn consume(&self) -> Result<NotificationStream, QueueError> {
            let items = self.0.lock().take().ok_or(QueueError::AlreadyConsuming)?;
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn event(id: i64, name: &str) -> Event {
        let start = DateTime::from_ymd_hm(2024, 7, 1, 15, 0).unwrap();
        Event {
            id,
            ..Event::new(name, start, start + chrono::Duration::minutes(45)).with_reminder(10)
        }
    }

    fn payload(id: i64, name: &str) -> NotificationPayload {
        NotificationPayload::from(&event(id, name))
    }

    #[tokio::test]
    async fn test_run_requires_queue() {
        let sender = Sender::new();
        assert!(matches!(
            sender.run().await,
            Err(SenderError::QueueNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_delivers_until_queue_closes() {
        let queue = Arc::new(InMemoryQueue::default());
        for (id, name) in [(1, "standup"), (2, "review"), (3, "retro")] {
            queue.push(&event(id, name)).await.unwrap();
        }
        queue.close().await.unwrap();

        let notifier = Arc::new(RecordingNotifier {
            fail_on: Some("review".to_string()),
            ..Default::default()
        });
        let sender = Sender::new()
            .with_queue(queue)
            .with_notifier(notifier.clone());

        sender.run().await.unwrap();

        // A failed delivery does not stop the loop
        assert_eq!(notifier.names(), vec!["standup", "review", "retro"]);
        assert_eq!(sender.delivered(), 2);
        assert_eq!(sender.failed(), 1);
        assert!(!sender.is_running());
    }

    #[tokio::test]
    async fn test_receive_errors_are_skipped() {
        let queue = Arc::new(ScriptedQueue(Mutex::new(Some(vec![
            Ok(payload(1, "first")),
            Err(QueueError::Serialization("bad payload".to_string())),
            Ok(payload(2, "second")),
        ]))));
        let notifier = Arc::new(RecordingNotifier::default());
        let sender = Sender::new()
            .with_queue(queue)
            .with_notifier(notifier.clone());

        sender.run().await.unwrap();
        assert_eq!(notifier.names(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_idle_stream() {
        let queue = Arc::new(InMemoryQueue::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let sender = Arc::new(
            Sender::new()
                .with_queue(queue.clone())
                .with_notifier(notifier.clone()),
        );

        let runner = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run().await })
        };

        queue.push(&event(9, "planning")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(notifier.names(), vec!["planning"]);
        assert!(sender.is_running());

        sender.stop();
        sender.stop();
        runner.await.unwrap().unwrap();
        assert_eq!(sender.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_running() {
        let queue = Arc::new(InMemoryQueue::default());
        let sender = Arc::new(Sender::new().with_queue(queue.clone()));
        sender.stop();

        let runner = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run().await })
        };
        tokio::task::yield_now().await;
        while !sender.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            sender.run().await,
            Err(SenderError::AlreadyRunning)
        ));

        queue.close().await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_payload() {
        LogNotifier.notify(&payload(4, "sync")).await.unwrap();
    }
}
