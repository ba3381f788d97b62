//! Exponential retry delay shared by all acquisition modes.

use std::time::Duration;

/// Starting delay after the first failure.
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Doubling delay between consecutive failures, capped.
///
/// `next_delay` hands out the current delay and doubles it for next time;
/// `reset` returns to the floor after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Backoff {
            floor,
            cap,
            current: floor,
        }
    }

    /// Delay to sleep before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.cap);
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
