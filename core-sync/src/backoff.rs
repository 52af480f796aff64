//! Exponential backoff for the optional automatic retry of failed items.

use core_runtime::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Doubling delay capped at `max`.
///
/// With jitter the delay is drawn from the upper half of the window, so a
/// retry never fires immediately but a burst of failures spreads out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before the retry that follows `attempt` failures
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let window = self
            .base
            .saturating_mul(1u32 << doublings)
            .min(self.max);

        if !self.jitter {
            return window;
        }
        let half = window / 2;
        let spread = u64::try_from((window - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }
}

/// When and how long to wait before re-queueing a failed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// `attempts` counts failures recorded so far
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Backoff::new(config.base_delay, config.max_delay, config.jitter),
        )
    }
}
