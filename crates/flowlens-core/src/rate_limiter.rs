//! Process-wide minimum-interval rate limiter.
//!
//! Every dispatch reserves the next free slot under a short critical section:
//! `slot = max(now, last_slot + min_interval)`. The caller then sleeps until its slot
//! outside the lock, so consecutive slots are always at least `min_interval` apart while
//! no caller holds the lock across an `.await`. Slots are handed out in lock
//! acquisition order.
//!
//! Spacing is guaranteed between reserved slots, not between observed wake-ups: the
//! planned slot is recorded as the last dispatch, so a caller woken late by timer jitter
//! may release closer than `min_interval` to the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_slot: Mutex<Option<Instant>>,
    acquisitions: AtomicU64,
}

impl RateLimiter {
    /// Budget in requests per second. Zero, negative or non-finite budgets disable throttling.
    pub fn new(rate_per_second: f64) -> Self {
        let min_interval = if rate_per_second.is_finite() && rate_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_second)
        } else {
            Duration::ZERO
        };
        Self::with_interval(min_interval)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_slot: Mutex::new(None),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Total number of completed or in-progress acquisitions.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Wait until this caller may dispatch. Returns the reserved dispatch instant.
    pub async fn acquire(&self) -> Instant {
        let slot = self.reserve_slot(Instant::now());
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        if slot > now {
            trace!(wait_ms = (slot - now).as_millis() as u64, "rate limiter delaying dispatch");
            tokio::time::sleep_until(slot).await;
        }
        slot
    }

    fn reserve_slot(&self, now: Instant) -> Instant {
        let mut last_slot = self
            .last_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = match *last_slot {
            Some(previous) => now.max(previous + self.min_interval),
            None => now,
        };
        *last_slot = Some(slot);
        slot
    }
}
