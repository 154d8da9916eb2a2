//! Category-aware exponential backoff.
//!
//! Connection and timeout failures grow from a slower baseline (longer first
//! delay, larger multiplier) than the other categories: an unreachable
//! endpoint does not come back faster because we knock harder, and tight
//! retry loops during an outage turn into failure storms.
//!
//! ```text
//! attempt          1      2      3      4      5
//! default        0.8s   1.6s   3.2s   6.4s  12.8s
//! connection     1.5s  3.75s  9.38s  18.0s  18.0s   (capped)
//! ```
//!
//! Rate-limit failures wait for the server's `Retry-After` hint when one is
//! present and otherwise fall back to the default baseline. Every delay,
//! jitter included, is capped at `max_delay`.

use std::time::Duration;

use rand::Rng;

use crate::classifier::ErrorCategory;

/// Backoff policy keyed by error category.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// First delay for non-transport categories.
    pub base_delay: Duration,
    /// Growth factor for non-transport categories.
    pub multiplier: f64,
    /// First delay for `Connection` / `Timeout`.
    pub transport_base_delay: Duration,
    /// Growth factor for `Connection` / `Timeout`.
    pub transport_multiplier: f64,
    /// Ceiling applied to every delay.
    pub max_delay: Duration,
    /// Upper bound of the random extra delay added to each wait (zero disables jitter).
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(800),
            multiplier: 2.0,
            transport_base_delay: Duration::from_millis(1500),
            transport_multiplier: 2.5,
            max_delay: Duration::from_secs(18),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Set the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the delay ceiling.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Deterministic delay before the attempt following `attempt`.
    ///
    /// `attempt` is 1-based; 0 is treated as 1.
    pub fn base_delay_for(&self, attempt: u32, category: ErrorCategory) -> Duration {
        let (base, factor) = if category.is_transport() {
            (self.transport_base_delay, self.transport_multiplier)
        } else {
            (self.base_delay, self.multiplier)
        };

        let exponent = attempt.max(1).saturating_sub(1).min(64) as i32;
        let secs = base.as_secs_f64() * factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before the next attempt, without a server hint.
    pub fn next_delay(&self, attempt: u32, category: ErrorCategory) -> Duration {
        self.next_delay_with_hint(attempt, category, None)
    }

    /// Delay before the next attempt.
    ///
    /// A `retry_after` hint only applies to `RateLimit` failures.
    pub fn next_delay_with_hint(
        &self,
        attempt: u32,
        category: ErrorCategory,
        retry_after: Option<Duration>,
    ) -> Duration {
        let delay = match (category, retry_after) {
            (ErrorCategory::RateLimit, Some(hint)) => hint.min(self.max_delay),
            _ => self.base_delay_for(attempt, category),
        };
        self.apply_jitter(delay)
    }

    /// Upper bound on the total time spent sleeping during one call of
    /// `max_attempts` attempts.
    pub fn worst_case_budget(&self, max_attempts: u32) -> Duration {
        self.max_delay
            .saturating_mul(max_attempts.saturating_sub(1))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        (delay + Duration::from_millis(extra_ms)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_ATTEMPTS: u32 = 5;

    #[test]
    fn test_default_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (1..=MAX_ATTEMPTS)
            .map(|a| policy.next_delay(a, ErrorCategory::Unknown))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_millis(3200),
                Duration::from_millis(6400),
                Duration::from_millis(12800),
            ]
        );
    }

    #[test]
    fn test_connection_is_slower_and_monotonic() {
        let policy = BackoffPolicy::default();
        for category in [ErrorCategory::Connection, ErrorCategory::Timeout] {
            let mut previous = Duration::ZERO;
            for attempt in 1..=MAX_ATTEMPTS {
                let slow = policy.next_delay(attempt, category);
                let fast = policy.next_delay(attempt, ErrorCategory::Unknown);
                assert!(slow >= fast, "attempt {}: {:?} < {:?}", attempt, slow, fast);
                assert!(slow >= previous);
                assert!(slow <= policy.max_delay);
                previous = slow;
            }
        }
    }

    #[test]
    fn test_ceiling_holds_for_large_attempts() {
        let policy = BackoffPolicy::default();
        for category in ErrorCategory::ALL {
            assert_eq!(policy.next_delay(1_000, category), policy.max_delay);
            assert_eq!(policy.next_delay(u32::MAX, category), policy.max_delay);
        }
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.next_delay(0, ErrorCategory::Unknown),
            policy.next_delay(1, ErrorCategory::Unknown)
        );
    }

    #[test]
    fn test_rate_limit_hint() {
        let policy = BackoffPolicy::default();
        let hinted =
            policy.next_delay_with_hint(1, ErrorCategory::RateLimit, Some(Duration::from_secs(4)));
        assert_eq!(hinted, Duration::from_secs(4));

        let capped = policy.next_delay_with_hint(
            1,
            ErrorCategory::RateLimit,
            Some(Duration::from_secs(600)),
        );
        assert_eq!(capped, policy.max_delay);

        let unhinted = policy.next_delay(2, ErrorCategory::RateLimit);
        assert_eq!(unhinted, policy.next_delay(2, ErrorCategory::Unknown));
    }

    #[test]
    fn test_hint_ignored_for_other_categories() {
        let policy = BackoffPolicy::default();
        let delay = policy.next_delay_with_hint(
            1,
            ErrorCategory::Connection,
            Some(Duration::from_millis(1)),
        );
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_jitter_never_exceeds_ceiling() {
        let policy = BackoffPolicy::default().with_jitter(Duration::from_secs(5));
        for _ in 0..200 {
            for attempt in 1..=MAX_ATTEMPTS {
                let delay = policy.next_delay(attempt, ErrorCategory::Connection);
                assert!(delay <= policy.max_delay);
                assert!(delay >= policy.base_delay_for(attempt, ErrorCategory::Connection));
            }
        }
    }

    #[test]
    fn test_worst_case_budget() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.worst_case_budget(5), Duration::from_secs(72));
        assert_eq!(policy.worst_case_budget(1), Duration::ZERO);
        assert_eq!(policy.worst_case_budget(0), Duration::ZERO);
    }
}
