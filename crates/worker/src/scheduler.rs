//! Reminder scheduler
//!
//! Scans storage on a fixed interval for events whose reminder falls in the
//! window since the previous scan, queues them and marks them notified.
//!
//! Windows are `[previous scan, this scan]`, inclusive on both ends; the
//! first scan has no lower bound. The cursor lives in memory only, so a
//! restarted scheduler begins with an unbounded window again and picks up
//! every pending reminder.
//!
//! Failure handling per scan:
//! - query failure: the scan is abandoned, the cursor still advances
//! - push failure: the event is left unmarked and is not retried, since
//!   the next window starts after its notify time
//! - mark failure: logged; the reminder was already queued

use std::sync::Arc;
use std::time::Duration;

use calendar_core::{DateTime, EventId};
use calendar_queue::{Queue, QueueError};
use calendar_storage::{Storage, StorageError};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::lifecycle::{Lifecycle, WorkerStatus};

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime + Send + Sync>;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("storage is not initialized")]
    StorageNotInitialized,

    #[error("queue is not initialized")]
    QueueNotInitialized,

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scan interval must be positive")]
    InvalidScanTimeout,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome of one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Lower bound of the window; `None` on the first scan
    pub window_start: Option<DateTime>,
    /// Upper bound of the window, also the time events are marked with
    pub window_end: DateTime,
    /// Events pushed to the queue
    pub queued: Vec<EventId>,
    /// Events whose push failed; left unmarked
    pub push_failed: Vec<EventId>,
    /// Events pushed but not marked notified
    pub mark_failed: Vec<EventId>,
    /// Events removed by the retention sweep
    pub swept: u64,
}

impl ScanReport {
    fn new(window_start: Option<DateTime>, window_end: DateTime) -> Self {
        Self {
            window_start,
            window_end,
            queued: Vec::new(),
            push_failed: Vec::new(),
            mark_failed: Vec::new(),
            swept: 0,
        }
    }
}

/// Periodic reminder scanner
///
/// # Example
///
/// ```ignore
/// let scheduler = Arc::new(
///     Scheduler::new(&config)
///         .with_storage(storage)
///         .with_queue(queue),
/// );
///
/// let runner = scheduler.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// // ... later
/// scheduler.stop();
/// ```
pub struct Scheduler {
    scan_timeout: Duration,
    retention: Option<Duration>,
    storage: Option<Arc<dyn Storage>>,
    queue: Option<Arc<dyn Queue>>,
    clock: Clock,
    window_start: Mutex<Option<DateTime>>,
    lifecycle: Lifecycle,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            scan_timeout: config.scan_timeout,
            retention: config.retention,
            storage: None,
            queue: None,
            clock: Arc::new(DateTime::now),
            window_start: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Replace the wall clock
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Start the first window at `start` instead of leaving it unbounded
    pub fn with_window_start(self, start: DateTime) -> Self {
        *self.window_start.lock() = Some(start);
        self
    }

    /// End of the last scanned window
    pub fn window_start(&self) -> Option<DateTime> {
        *self.window_start.lock()
    }

    pub fn status(&self) -> WorkerStatus {
        self.lifecycle.status()
    }

    pub fn is_running(&self) -> bool {
        self.status() != WorkerStatus::Stopped
    }

    /// Scan immediately, then every `scan_timeout` until [`Scheduler::stop`]
    ///
    /// Closes the queue before returning.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let queue = self
            .queue
            .clone()
            .ok_or(SchedulerError::QueueNotInitialized)?;
        if self.storage.is_none() {
            return Err(SchedulerError::StorageNotInitialized);
        }
        if self.scan_timeout.is_zero() {
            return Err(SchedulerError::InvalidScanTimeout);
        }

        let mut shutdown_rx = self
            .lifecycle
            .begin()
            .ok_or(SchedulerError::AlreadyRunning)?;

        info!(
            scan_timeout_ms = self.scan_timeout.as_millis() as u64,
            retention_secs = self.retention.map(|r| r.as_secs()),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.scan_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "Scan failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Scheduler loop: shutdown requested");
                    break;
                }
            }
        }

        let closed = queue.close().await;
        self.lifecycle.finish();

        if let Err(e) = closed {
            error!(error = %e, "Failed to close queue");
            return Err(e.into());
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// Ask a running scheduler to stop; no-op otherwise
    pub fn stop(&self) {
        if self.lifecycle.stop() {
            info!("Scheduler stop requested");
        }
    }

    /// Run one scan over `[window_start, now]`
    ///
    /// The cursor moves to `now` whatever the outcome.
    pub async fn scan(&self) -> Result<ScanReport, SchedulerError> {
        let storage = self
            .storage
            .clone()
            .ok_or(SchedulerError::StorageNotInitialized)?;
        let queue = self
            .queue
            .clone()
            .ok_or(SchedulerError::QueueNotInitialized)?;

        let window_end = (self.clock)();
        let window_start = self.window_start();

        let result = self
            .scan_window(storage.as_ref(), queue.as_ref(), window_start, window_end)
            .await;

        *self.window_start.lock() = Some(window_end);
        result
    }

    async fn scan_window(
        &self,
        storage: &dyn Storage,
        queue: &dyn Queue,
        window_start: Option<DateTime>,
        window_end: DateTime,
    ) -> Result<ScanReport, SchedulerError> {
        let events = storage
            .get_events_to_notify(window_start, Some(window_end))
            .await?;

        let mut report = ScanReport::new(window_start, window_end);

        for event in &events {
            if let Err(e) = queue.push(event).await {
                warn!(
                    event_id = event.id,
                    error = %e,
                    "Failed to queue reminder, event left unmarked"
                );
                report.push_failed.push(event.id);
                continue;
            }
            report.queued.push(event.id);

            if let Err(e) = storage.mark_event_as_notified(event.id, window_end).await {
                error!(event_id = event.id, error = %e, "Failed to mark event as notified");
                report.mark_failed.push(event.id);
            }
        }

        if let Some(retention) = self.retention {
            report.swept = self.sweep(storage, window_end, retention).await;
        }

        if report.queued.is_empty() && report.push_failed.is_empty() {
            debug!(window_end = %window_end, "No reminders due");
        } else {
            info!(
                window_start = ?window_start.map(|t| t.to_string()),
                window_end = %window_end,
                queued = report.queued.len(),
                push_failed = report.push_failed.len(),
                mark_failed = report.mark_failed.len(),
                "Scan complete"
            );
        }

        Ok(report)
    }

    /// Delete events that ended before `now - retention`; failures are logged
    async fn sweep(&self, storage: &dyn Storage, now: DateTime, retention: Duration) -> u64 {
        let cutoff = match chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| now.as_chrono().checked_sub_signed(age))
        {
            Some(cutoff) => DateTime::from(cutoff),
            None => {
                warn!(
                    retention_secs = retention.as_secs(),
                    "Retention out of range, sweep skipped"
                );
                return 0;
            }
        };

        match storage.delete_events_ended_before(cutoff).await {
            Ok(swept) => {
                if swept > 0 {
                    info!(swept, cutoff = %cutoff, "Removed expired events");
                }
                swept
            }
            Err(e) => {
                error!(error = %e, "Retention sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use calendar_core::Event;
    use calendar_queue::{InMemoryQueue, NotificationStream};
    use calendar_storage::InMemoryStorage;
    use futures::{FutureExt, StreamExt};

    const T: i64 = 10;

    fn boundary() -> DateTime {
        DateTime::from_ymd_hm(2024, 1, 15, 12, 0).unwrap()
    }

    fn minutes(offset: i64) -> DateTime {
        boundary() + chrono::Duration::minutes(offset)
    }

    /// Event whose reminder is due at `boundary + offset` minutes
    fn due_at(name: &str, offset: i64) -> Event {
        let start = minutes(offset + 5);
        Event::new(name, start, start + chrono::Duration::minutes(30)).with_reminder(5)
    }

    /// Clock the test moves by hand
    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime>>);

    impl ManualClock {
        fn at(now: DateTime) -> Self {
            Self(Arc::new(Mutex::new(now)))
        }

        fn set(&self, now: DateTime) {
            *self.0.lock() = now;
        }

        fn reader(&self) -> impl Fn() -> DateTime + Send + Sync + 'static {
            let inner = self.0.clone();
            move || *inner.lock()
        }
    }

    /// Queue that rejects events by name and forwards the rest
    struct RejectingQueue {
        inner: InMemoryQueue,
        rejected: HashSet<String>,
    }

    #[async_trait]
    impl Queue for RejectingQueue {
        async fn push(&self, event: &Event) -> Result<(), QueueError> {
            if self.rejected.contains(&event.name) {
                return Err(QueueError::Connection("broker unavailable".to_string()));
            }
            self.inner.push(event).await
        }

        async fn consume(&self) -> Result<NotificationStream, QueueError> {
            self.inner.consume().await
        }

        async fn close(&self) -> Result<(), QueueError> {
            self.inner.close().await
        }
    }

    /// Storage whose reminder query always fails
    struct UnreachableStorage(InMemoryStorage);

    #[async_trait]
    impl Storage for UnreachableStorage {
        async fn add_event(&self, event: Event) -> Result<EventId, StorageError> {
            self.0.add_event(event).await
        }
        async fn update_event(&self, id: EventId, event: Event) -> Result<(), StorageError> {
            self.0.update_event(id, event).await
        }
        async fn delete_event(&self, id: EventId) -> Result<(), StorageError> {
            self.0.delete_event(id).await
        }
        async fn get_event(&self, id: EventId) -> Result<Event, StorageError> {
            self.0.get_event(id).await
        }
        async fn get_all_events(&self) -> Result<Vec<Event>, StorageError> {
            self.0.get_all_events().await
        }
        async fn get_events_by_period(
            &self,
            from: DateTime,
            to: DateTime,
        ) -> Result<Vec<Event>, StorageError> {
            self.0.get_events_by_period(from, to).await
        }
        async fn get_events_to_notify(
            &self,
            _from: Option<DateTime>,
            _to: Option<DateTime>,
        ) -> Result<Vec<Event>, StorageError> {
            Err(StorageError::Timeout(Duration::from_secs(5)))
        }
        async fn mark_event_as_notified(
            &self,
            id: EventId,
            when: DateTime,
        ) -> Result<(), StorageError> {
            self.0.mark_event_as_notified(id, when).await
        }
        async fn delete_events_ended_before(&self, cutoff: DateTime) -> Result<u64, StorageError> {
            self.0.delete_events_ended_before(cutoff).await
        }
        async fn count(&self) -> Result<usize, StorageError> {
            self.0.count().await
        }
        async fn clear_all(&self) -> Result<(), StorageError> {
            self.0.clear_all().await
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default().with_scan_timeout(Duration::from_secs(T as u64 * 60))
    }

    async fn names(storage: &InMemoryStorage, ids: &[EventId]) -> Vec<String> {
        let mut names = Vec::new();
        for id in ids {
            names.push(storage.get_event(*id).await.unwrap().name);
        }
        names
    }

    #[tokio::test]
    async fn test_run_requires_dependencies() {
        let bare = Scheduler::new(&config());
        assert!(matches!(
            bare.run().await,
            Err(SchedulerError::QueueNotInitialized)
        ));

        let queue_only = Scheduler::new(&config()).with_queue(Arc::new(InMemoryQueue::default()));
        assert!(matches!(
            queue_only.run().await,
            Err(SchedulerError::StorageNotInitialized)
        ));
        assert!(!queue_only.is_running());
    }

    #[tokio::test]
    async fn test_first_scan_has_no_lower_bound() {
        let storage = Arc::new(InMemoryStorage::new());
        let overdue = storage.add_event(due_at("overdue", -600)).await.unwrap();
        storage.add_event(due_at("future", 5)).await.unwrap();

        let scheduler = Scheduler::new(&config())
            .with_storage(storage.clone())
            .with_queue(Arc::new(InMemoryQueue::default()))
            .with_clock(|| minutes(0));

        let report = scheduler.scan().await.unwrap();
        assert_eq!(report.window_start, None);
        assert_eq!(report.window_end, minutes(0));
        assert_eq!(report.queued, vec![overdue]);
        assert_eq!(scheduler.window_start(), Some(minutes(0)));
    }

    #[tokio::test]
    async fn test_successive_windows_partition_reminders() {
        let storage = Arc::new(InMemoryStorage::new());
        for (name, offset) in [
            ("A", -10),
            ("B", -1),
            ("C", 0),
            ("D", 1),
            ("E", T),
            ("F", T + 1),
            ("G", 2 * T + 1),
            ("H", 3 * T),
        ] {
            storage.add_event(due_at(name, offset)).await.unwrap();
        }

        let queue = Arc::new(InMemoryQueue::new(16));
        let clock = ManualClock::at(minutes(0));
        let scheduler = Scheduler::new(&config())
            .with_storage(storage.clone())
            .with_queue(queue.clone())
            .with_clock(clock.reader())
            .with_window_start(boundary());

        let mut scanned = Vec::new();
        for scan in 1..=3 {
            clock.set(minutes(scan * T));
            let report = scheduler.scan().await.unwrap();
            assert!(report.push_failed.is_empty());
            scanned.push(names(&storage, &report.queued).await);
        }

        assert_eq!(
            scanned,
            vec![vec!["C", "D", "E"], vec!["F"], vec!["G", "H"]]
        );

        // Everything queued was marked with the end of its window
        let e = storage.get_all_events().await.unwrap();
        let e = e.iter().find(|e| e.name == "E").unwrap();
        assert_eq!(e.notified_at, Some(minutes(T)));

        // Queue received the same six payloads in scan order
        let mut stream = queue.consume().await.unwrap();
        let mut delivered = Vec::new();
        for _ in 0..6 {
            delivered.push(stream.next().await.unwrap().unwrap().name);
        }
        assert_eq!(delivered, vec!["C", "D", "E", "F", "G", "H"]);
        assert!(stream.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_push_failure_leaves_event_unmarked() {
        let storage = Arc::new(InMemoryStorage::new());
        let broken = storage.add_event(due_at("broken", 2)).await.unwrap();
        let fine = storage.add_event(due_at("fine", 3)).await.unwrap();

        let queue = Arc::new(RejectingQueue {
            inner: InMemoryQueue::default(),
            rejected: HashSet::from(["broken".to_string()]),
        });
        let clock = ManualClock::at(minutes(T));
        let scheduler = Scheduler::new(&config())
            .with_storage(storage.clone())
            .with_queue(queue)
            .with_clock(clock.reader())
            .with_window_start(boundary());

        let report = scheduler.scan().await.unwrap();
        assert_eq!(report.queued, vec![fine]);
        assert_eq!(report.push_failed, vec![broken]);
        assert!(!storage.get_event(broken).await.unwrap().is_notified());
        assert!(storage.get_event(fine).await.unwrap().is_notified());

        // Not retried: the next window starts after its notify time
        clock.set(minutes(2 * T));
        let next = scheduler.scan().await.unwrap();
        assert!(next.queued.is_empty());
        assert!(next.push_failed.is_empty());
        assert!(!storage.get_event(broken).await.unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_query_failure_still_advances_cursor() {
        let storage = Arc::new(UnreachableStorage(InMemoryStorage::new()));
        let scheduler = Scheduler::new(&config())
            .with_storage(storage)
            .with_queue(Arc::new(InMemoryQueue::default()))
            .with_clock(|| minutes(T))
            .with_window_start(boundary());

        let result = scheduler.scan().await;
        assert!(matches!(
            result,
            Err(SchedulerError::Storage(StorageError::Timeout(_)))
        ));
        assert_eq!(scheduler.window_start(), Some(minutes(T)));
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let storage = Arc::new(InMemoryStorage::new());
        let ancient_start = minutes(-3 * 24 * 60);
        storage
            .add_event(Event::new(
                "ancient",
                ancient_start,
                ancient_start + chrono::Duration::hours(1),
            ))
            .await
            .unwrap();
        let recent = storage.add_event(due_at("recent", -60)).await.unwrap();

        let scheduler = Scheduler::new(
            &config().with_retention(Duration::from_secs(24 * 60 * 60)),
        )
        .with_storage(storage.clone())
        .with_queue(Arc::new(InMemoryQueue::default()))
        .with_clock(|| minutes(0));

        let report = scheduler.scan().await.unwrap();
        assert_eq!(report.swept, 1);
        assert_eq!(report.queued, vec![recent]);
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scans_on_every_tick_until_stopped() {
        let storage = Arc::new(InMemoryStorage::new());
        let first = storage.add_event(due_at("first", 0)).await.unwrap();

        let queue = Arc::new(InMemoryQueue::default());
        let clock = ManualClock::at(minutes(0));
        let scheduler = Arc::new(
            Scheduler::new(&config())
                .with_storage(storage.clone())
                .with_queue(queue.clone())
                .with_clock(clock.reader()),
        );

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        // First scan runs immediately
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.is_running());
        assert!(storage.get_event(first).await.unwrap().is_notified());
        assert_eq!(scheduler.window_start(), Some(minutes(0)));

        let second = storage.add_event(due_at("second", T / 2)).await.unwrap();
        clock.set(minutes(T));
        tokio::time::sleep(Duration::from_secs(T as u64 * 60)).await;
        assert!(storage.get_event(second).await.unwrap().is_notified());
        assert_eq!(scheduler.window_start(), Some(minutes(T)));

        scheduler.stop();
        scheduler.stop();
        runner.await.unwrap().unwrap();

        assert!(!scheduler.is_running());
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_is_ignored() {
        let scheduler = Arc::new(
            Scheduler::new(&config())
                .with_storage(Arc::new(InMemoryStorage::new()))
                .with_queue(Arc::new(InMemoryQueue::default()))
                .with_clock(|| minutes(0)),
        );
        scheduler.stop();

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.run().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop();
        runner.await.unwrap().unwrap();
        assert_eq!(scheduler.status(), WorkerStatus::Stopped);
    }
}
