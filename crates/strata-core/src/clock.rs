//! Wall time, monotonic time and sleeping behind one trait so cooldowns,
//! retry backoff and rate limits are deterministic under test.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source used by every component with a deadline or a backoff.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for measuring elapsed time and cooldowns.
    fn monotonic(&self) -> Instant;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock: chrono wall time, std monotonic time, tokio sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock with a settable wall time. `sleep` advances both clocks by the
/// requested duration and yields once, so backoff-heavy paths run instantly.
pub struct ManualClock {
    start: Instant,
    state: Mutex<ManualState>,
}

struct ManualState {
    now: DateTime<Utc>,
    offset: Duration,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            start: Instant::now(),
            state: Mutex::new(ManualState {
                now,
                offset: Duration::ZERO,
            }),
        }
    }

    /// Starts at the current wall time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move both the wall clock and the monotonic clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.offset += duration;
        state.now = state.now
            + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().now
    }

    fn monotonic(&self) -> Instant {
        self.start + self.state.lock().unwrap().offset
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
