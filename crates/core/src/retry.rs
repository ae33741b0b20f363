//! Bounded retries for establishing connections
//!
//! Only the connection layer retries, and only while a backend is being
//! constructed. Once a pool or listener exists, failures surface to the
//! caller as-is.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

/// Exponential backoff with jitter for connection attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect(5)
    }
}

impl RetryPolicy {
    /// Policy for initial connections: `attempts` tries, 1s doubling up to 30s
    pub fn connect(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(interval: Duration, attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before `attempt` (1-based); zero for the first attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Run `connect` until it succeeds or attempts are exhausted
    ///
    /// Returns the last error when every attempt fails.
    pub async fn retry<T, E, F, Fut>(&self, target: &str, mut connect: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match connect().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(target_name = target, attempt, "Connected after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt + 1);
                    warn!(
                        target_name = target,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        target_name = target,
                        attempts = attempt,
                        error = %e,
                        "Giving up on connection"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_connect_defaults() {
        let policy = RetryPolicy::connect(3);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(RetryPolicy::connect(0).max_attempts, 1);
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::connect(5).with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 5);

        let result: Result<u32, String> = policy
            .retry("test", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("refused #{n}"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 2);

        let result: Result<(), String> = policy
            .retry("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("refused".to_string())
            })
            .await;

        assert_eq!(result, Err("refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
