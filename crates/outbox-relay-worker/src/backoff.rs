//! Retry delay calculation.

use rand::Rng;
use relay_config_and_utils::RelayConfig;
use std::time::Duration;

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Fraction of the delay used as the ± jitter range. `0.0` disables jitter.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(2000),
            max_interval: Duration::from_millis(300_000),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            base_interval: Duration::from_millis(config.backoff_base_ms),
            max_interval: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.backoff_jitter,
        }
    }

    /// Delay before retry number `attempt`, without jitter.
    ///
    /// `min(max_interval, base_interval * multiplier^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_interval.as_millis() as f64;
        let max_ms = self.max_interval.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base_ms * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `attempt`, perturbed by a uniform draw in
    /// `±jitter_factor * delay` and clamped at zero.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay_ms = self.base_delay(attempt).as_millis() as f64;
        let spread = delay_ms * self.jitter_factor.max(0.0);
        if spread <= 0.0 {
            return Duration::from_millis(delay_ms as u64);
        }
        let jittered = delay_ms + rng.gen_range(-spread..=spread);
        Duration::from_millis(jittered.max(0.0).round() as u64)
    }
}
