//! # Reconnect Backoff
//!
//! Exponential backoff with ±25% jitter and a capped delay. The same schedule
//! drives the startup connection loop and the substrate's background
//! reconnects, so a fleet of clients restarting together spreads out instead
//! of hammering the server in lockstep.

use rand::Rng;
use std::time::Duration;

/// Fraction of the delay added or removed at random.
pub const JITTER_RATIO: f64 = 0.25;

/// Exponent ceiling; keeps `2^n` from overflowing before the cap applies.
const MAX_EXPONENT: u32 = 16;

/// Delay schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            jitter: JITTER_RATIO,
        }
    }

    /// Policy without randomness, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (0 is the first retry), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt`, jittered and capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.max_delay)
    }

    /// Smallest delay [`delay`](Self::delay) can return for `attempt`.
    pub fn min_delay(&self, attempt: u32) -> Duration {
        self.nominal_delay(attempt).mul_f64(1.0 - self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(policy.nominal_delay(4), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..200 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(150), "{d:?} below band");
            assert!(d <= Duration::from_millis(250), "{d:?} above band");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(120));
        for _ in 0..200 {
            assert!(policy.delay(5) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1)).without_jitter();
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.min_delay(2), Duration::from_millis(200));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(10));
        assert_eq!(policy.nominal_delay(0), Duration::from_millis(500));
    }
}
