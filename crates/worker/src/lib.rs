// Calendar reminder workers
//
// - Scheduler: scans storage every interval and queues due reminders
// - Sender: drains the queue and delivers through a Notifier
//
// Both run until stop() is called and share nothing but storage and the queue.

pub mod config;
mod lifecycle;
pub mod scheduler;
pub mod sender;

pub use config::{SchedulerConfig, SenderConfig, DEFAULT_SCAN_TIMEOUT};
pub use lifecycle::WorkerStatus;
pub use scheduler::{Clock, ScanReport, Scheduler, SchedulerError};
pub use sender::{LogNotifier, Notifier, NotifyError, Sender, SenderError};
