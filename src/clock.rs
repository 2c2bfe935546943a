//! Clock capability for scheduler timing
//!
//! The window scheduler never consults wall time directly. It receives a
//! `Clock` so tests can drive hop boundaries deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Time source used by the scheduling pipeline.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// System clock backed by `chrono` and `tokio::time`.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests.
///
/// `sleep` advances the clock instead of suspending, so scheduler tests run
/// instantly while observing the same time arithmetic as production.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<TestClockState>>,
}

struct TestClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl TestClock {
    /// Create a test clock starting at `epoch_seconds` past the Unix epoch.
    pub fn at_epoch(epoch_seconds: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestClockState {
                now: Utc.timestamp_opt(epoch_seconds, 0).unwrap(),
                sleeps: Vec::new(),
            })),
        }
    }

    /// Advance time without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.now += chrono::Duration::from_std(duration).unwrap();
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleep_calls(&self) -> Vec<Duration> {
        self.inner.lock().unwrap().sleeps.clone()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.sleeps.push(duration);
        state.now += chrono::Duration::from_std(duration).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_test_clock_sleep_advances_time() {
        let clock = TestClock::at_epoch(1_000);
        clock.sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now().timestamp(), 1_030);
        assert_eq!(clock.sleep_calls(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn test_test_clock_advance() {
        let clock = TestClock::at_epoch(0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now().timestamp(), 5);
        assert!(clock.sleep_calls().is_empty());
    }
}
