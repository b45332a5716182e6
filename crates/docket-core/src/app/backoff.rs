//! Restart policy: decides how long a failed background loop waits before
//! reopening its cursor.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Stand-in for "no deadline" (30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `timeout` from now, saturating 30 years out instead of
/// overflowing (e.g. for `Duration::MAX`).
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Exponential backoff with a ceiling and proportional jitter.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    /// No delay is ever longer than this.
    pub max_delay: Duration,

    /// Fraction of the delay that is randomised (0.0 disables jitter).
    pub jitter: f64,
}

impl RestartPolicy {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay,
            jitter: 0.2,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before restart number `failures` (1-indexed):
    /// `min(base * multiplier^(failures - 1), max)`, then jittered downwards.
    ///
    /// With base=100ms, multiplier=2.0, max=1s:
    /// - failure 1: 100ms
    /// - failure 2: 200ms
    /// - failure 4: 800ms
    /// - failure 5 and later: 1s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = if jitter > 0.0 {
            capped * (1.0 - rand::thread_rng().gen_range(0.0..jitter))
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
