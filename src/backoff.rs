//! Per-session reconnect backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff with proportional jitter.
///
/// Each session owns one of these, so a network blip that faults many
/// sessions at once does not synchronize their retries: attempt counters
/// and jitter draws are local.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Fraction of the delay added as random jitter; 0 disables
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            max: config.max,
            jitter: 0.1,
            attempt: 0,
        }
    }

    #[cfg(test)]
    fn without_jitter(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        // cap the shift, the delay is saturated at max anyway
        self.attempt = (self.attempt + 1).min(30);

        if self.jitter > 0.0 {
            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..self.jitter));
            delay + jitter
        } else {
            delay
        }
    }

    /// Reset after a successful return to streaming.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff =
            Backoff::without_jitter(Duration::from_secs(5), Duration::from_secs(60));

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff =
            Backoff::without_jitter(Duration::from_secs(5), Duration::from_secs(60));
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_proportional() {
        let mut backoff = Backoff::new(&BackoffConfig {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        });
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn attempt_counter_saturates() {
        let mut backoff =
            Backoff::without_jitter(Duration::from_millis(1), Duration::from_secs(60));
        for _ in 0..100 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(60));
        }
    }
}
