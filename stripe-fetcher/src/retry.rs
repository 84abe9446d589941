//! Backoff schedule between page request attempts.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::config::FetchPolicy;
use crate::error::ProviderError;

/// Delay generator for the retries of one page request.
///
/// Delays start at `base_delay` and grow by `multiplier` per attempt, each
/// randomized by `jitter` and capped at `max_delay`.
pub struct RetrySchedule {
    backoff: ExponentialBackoff,
    max_delay: Duration
}

impl RetrySchedule {
    pub fn new(policy: &FetchPolicy) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.base_delay)
            .with_multiplier(policy.multiplier.max(1.0))
            .with_randomization_factor(policy.jitter.clamp(0.0, 1.0))
            .with_max_interval(policy.max_delay)
            .with_max_elapsed_time(None)
            .build();

        Self {
            backoff,
            max_delay: policy.max_delay
        }
    }

    /// Delay to wait after `cause` before the next attempt.
    ///
    /// A provider `Retry-After` hint wins over a shorter computed delay.
    pub fn next_delay(&mut self, cause: &ProviderError) -> Duration {
        let computed = self.backoff.next_backoff().unwrap_or(self.max_delay);
        let delay = cause
            .retry_after()
            .map_or(computed, |hint| hint.max(computed));
        delay.min(self.max_delay)
    }
}
