//! Backoff timing for re-enqueued pool keys.
//!
//! Failed or panicked reconciliations go back on the queue; this controls
//! how long a worker waits before handing the key back.

use std::time::Duration;

/// Determines how long to back off before re-enqueueing a pool key.
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a clean reconcile.
    fn reset(&mut self);
    /// Gets how long to wait before the next retry.
    fn next_duration(&mut self) -> Duration;
}

/// Durations double until hitting a cap, in the style of the
/// controller-runtime rate limiter.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self {
            base_duration: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            last_duration: Duration::from_secs(0),
        }
    }
}

impl ExponentialBackoffStrategy {
    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };
        std::cmp::min(next_duration, self.cap)
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}
