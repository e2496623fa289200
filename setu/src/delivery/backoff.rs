//! Reconnect delay with exponential growth and jitter

use rand::Rng;
use std::time::Duration;

/// Per-connection reconnect backoff
///
/// Each fault doubles the delay up to `max`; the returned delay is jittered
/// into `[delay / 2, delay]` so parallel connections do not reconnect in
/// lockstep. An `initial` of zero disables the delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Delay before the next reconnect attempt
    pub fn next_delay(&mut self) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << self.attempts.min(16);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);

        let ms = delay.as_millis() as u64;
        if ms < 2 {
            return delay;
        }
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }

    /// Forget past faults after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_initial_is_immediate() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(10));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn test_delay_grows_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(200));

        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_secs(5));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }
}
