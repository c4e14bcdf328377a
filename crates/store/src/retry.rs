//! Retry backoff policy for outbox deliveries.
//!
//! The backoff is computed inside the store (not the publisher) so every
//! publisher instance schedules retries identically.

use std::time::Duration;

use rand::Rng;

/// Exponent is clamped so the doubling stops growing past this many attempts.
const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First-retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// An event whose attempts exceed this moves to the DLQ.
    pub max_retries: u32,
    /// Hard ceiling on any computed delay.
    pub cap: Duration,
    /// Jitter fraction in `[0, 1)`; 0 disables jitter (used by tests).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 10,
            cap: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the attempt count *after* the
    /// failure being recorded: `base × 2^min(attempts, 10)`, capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(MAX_BACKOFF_EXPONENT);
        let scaled = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap);
        let mut delay = scaled.min(self.cap);

        if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..self.jitter);
            delay = Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0)).min(self.cap);
        }
        delay
    }

    pub fn is_retryable(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_retries: 10,
            cap: Duration::from_secs(3600),
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped_at_one_hour() {
        let p = policy();
        assert_eq!(p.delay_for(12), Duration::from_secs(1024).min(p.cap));
        let wide = RetryPolicy {
            base_delay: Duration::from_secs(60),
            ..policy()
        };
        assert_eq!(wide.delay_for(10), Duration::from_secs(3600));
    }

    #[test]
    fn retryability_tracks_max_retries() {
        let p = policy();
        assert!(p.is_retryable(10));
        assert!(!p.is_retryable(11));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        for attempts in 0..14 {
            assert!(p.delay_for(attempts) <= p.cap);
        }
    }
}
