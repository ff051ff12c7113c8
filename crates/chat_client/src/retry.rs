use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded reconnect policy used by the connection supervisor.
///
/// `delay_for(n)` is how long attempt `n` (zero based) waits for the link to
/// come up before it counts as failed. A factor of `1.0` keeps the interval
/// fixed; larger factors grow it geometrically up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub check_interval: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            check_interval: DEFAULT_CHECK_INTERVAL,
            backoff_factor: 1.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, check_interval: Duration) -> Self {
        Self {
            max_attempts,
            check_interval,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_delay: Duration) -> Self {
        self.backoff_factor = factor.max(1.0);
        self.max_delay = max_delay;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.check_interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay.max(self.check_interval);
        }
        Duration::from_secs_f64(scaled)
    }

    /// True once `failed_attempts` consecutive attempts have used up the budget.
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts.max(1)
    }
}
