//! Exponential backoff schedule for retry loops

use std::time::Duration;

/// Exponentially growing delay, capped at a maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor applied after each delay
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// The delay that follows `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        // Clamp in f64 first; the product can exceed what Duration holds
        let secs = (current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).map_or(self.max, |next| next.min(self.max))
    }

    /// Iterate over successive delays, starting at `initial`
    pub fn delays(&self) -> Delays {
        Delays {
            policy: *self,
            next: std::cmp::min(self.initial, self.max),
        }
    }
}

/// Infinite iterator over backoff delays
#[derive(Debug, Clone)]
pub struct Delays {
    policy: ExponentialBackoff,
    next: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = self.policy.next_delay(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            2.0,
        );

        let delays: Vec<Duration> = backoff.delays().take(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn test_cap_holds() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            3.0,
        );
        assert!(backoff.delays().take(20).all(|d| d <= Duration::from_millis(250)));
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            1e20,
        );
        let delays: Vec<Duration> = backoff.delays().take(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        assert_eq!(backoff.next_delay(Duration::MAX), Duration::from_secs(10));
    }
}
