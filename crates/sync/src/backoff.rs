//! Retry delay calculation.
//!
//! `delay = min(max_delay, base_delay * 2^(attempt - 1)) + jitter`, with the
//! jitter drawn uniformly from `[0, jitter)`. Every function here depends only
//! on its arguments; callers that need determinism pass the RNG or the jitter
//! explicitly.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random delay added on top.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Delay before attempt `attempt` (1-indexed) without jitter.
    ///
    /// Attempt 0 is treated as attempt 1. The doubling saturates instead of
    /// overflowing, so very large attempt numbers land on `max_delay`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Capped delay plus an explicit jitter value.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.capped_delay(attempt).saturating_add(jitter)
    }

    /// Capped delay plus jitter drawn from `rng`.
    pub fn delay_with_rng<R>(&self, attempt: u32, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        let jitter_nanos = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.gen_range(0..jitter_nanos))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Capped delay plus jitter from the thread-local RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }
}

/// `delay_for` with the default policy (1s base, 5min cap, 1s jitter).
pub fn delay_for(attempt: u32) -> Duration {
    BackoffPolicy::default().delay_for(attempt)
}
