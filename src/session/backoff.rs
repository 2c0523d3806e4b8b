use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectSettings;

/// Bounded exponential backoff with additive jitter.
///
/// Attempt `n` (1-based) waits `min(initial * multiplier^(n-1), max)` plus a
/// random extra of up to `jitter` times that base. After `max_attempts`
/// failures the policy gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Delay before attempt `attempt` for a jitter sample in `[0, 1]`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        let extra_ms = base.as_millis() as f64 * self.jitter * sample.clamp(0.0, 1.0);
        base + Duration::from_millis(extra_ms as u64)
    }

    /// Jittered delay before attempt `attempt`, or `None` once attempts are
    /// used up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let sample = rand::rng().random_range(0.0..=1.0);
        Some(self.delay_with_sample(attempt, sample))
    }
}
