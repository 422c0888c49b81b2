//! Adaptive polling interval for the relay loop.

use std::time::Duration;

/// Poll interval bounded by `[min, max]`.
///
/// Any cycle that published at least one message snaps back to `min`; an
/// idle or fully failing cycle doubles the interval up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptiveInterval {
    /// Starts at `min`. A `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Adjust after a cycle that published `successes` messages.
    pub fn record(&mut self, successes: usize) -> Duration {
        self.current = if successes > 0 {
            self.min
        } else {
            self.current.saturating_mul(2).clamp(self.min, self.max)
        };
        self.current
    }

    /// Jump straight to `max`, used after a cycle that errored outright.
    pub fn back_off_fully(&mut self) -> Duration {
        self.current = self.max;
        self.current
    }
}
