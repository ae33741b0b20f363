// Calendar core
//
// Domain types shared by every part of the reminder pipeline:
// - DateTime: minute-precision UTC timestamp
// - Event: calendar entry with reminder settings
// - NotificationPayload: the flattened event carried by queues
// - RetryPolicy: bounded retries for initial connections
// - config: environment parsing shared by every component
//
// Note: This crate has NO dependency on storage or queue backends.

pub mod config;
pub mod event;
pub mod notification;
pub mod retry;
pub mod telemetry;
pub mod time;

pub use config::ConfigError;
pub use event::{Event, EventError, EventId};
pub use notification::NotificationPayload;
pub use retry::RetryPolicy;
pub use time::{DateTime, ParseDateTimeError, DATE_TIME_FORMAT};
