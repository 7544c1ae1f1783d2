/*
[INPUT]:  Back-off bounds and the count of consecutive failed cycles
[OUTPUT]: Jittered exponential delays between reconnect attempts
[POS]:    Session layer - reconnection pacing
[UPDATE]: When changing reconnect pacing or reset rules
*/

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; doubles per call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.apply_jitter(base)
    }

    /// Back to `min` after a stable connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.config
            .min
            .checked_mul(factor)
            .unwrap_or(self.config.max)
            .min(self.config.max)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff::new(BackoffConfig {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter,
        })
    }

    #[test]
    fn backoff_doubles_and_clamps_at_max() {
        let mut backoff = backoff(0.0);
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn backoff_reset_returns_to_min() {
        let mut backoff = backoff(0.0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_jitter_stays_within_fraction() {
        let mut backoff = backoff(0.2);
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1200), "{delay:?}");
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let mut backoff = backoff(0.0);
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
