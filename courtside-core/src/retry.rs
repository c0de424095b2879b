use std::time::Duration;

use courtside_model::FailureKind;
use rand::Rng;

use crate::config::{CollectorConfig, RetryConfig};

/// Exponential backoff with jitter on two tracks: one for transient
/// failures and a longer one for rate-limited responses.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    transient: RetryConfig,
    rate_limited: RetryConfig,
}

impl RetryPolicy {
    pub fn new(transient: RetryConfig, rate_limited: RetryConfig) -> Self {
        Self {
            transient,
            rate_limited,
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(config.retry.clone(), config.rate_limited_retry.clone())
    }

    fn track(&self, kind: FailureKind) -> &RetryConfig {
        match kind {
            FailureKind::RateLimited => &self.rate_limited,
            FailureKind::Transient | FailureKind::Permanent => &self.transient,
        }
    }

    /// Whether a task that has now failed `attempt_count` times may run
    /// again.
    pub fn should_retry(&self, kind: FailureKind, attempt_count: u16) -> bool {
        kind.is_retryable() && attempt_count < self.track(kind).max_attempts
    }

    /// Un-jittered delay after the `attempt`-th failure:
    /// `min(max, base * 2^(attempt - 1))`.
    pub fn base_delay(&self, kind: FailureKind, attempt: u16) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let track = self.track(kind);
        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (track.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(track.backoff_max_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay using `unit` in `[0, 1]` to pick a point within
    /// `base * (1 ± jitter_ratio)`.
    pub fn delay_with_unit(
        &self,
        kind: FailureKind,
        attempt: u16,
        unit: f64,
    ) -> Duration {
        let anchor = self.base_delay(kind, attempt).as_millis() as f64;
        if anchor == 0.0 {
            return Duration::ZERO;
        }
        let ratio = self.track(kind).jitter_ratio.clamp(0.0, 1.0);
        let lower = anchor * (1.0 - ratio);
        let upper = anchor * (1.0 + ratio);
        let jittered = lower + (upper - lower) * unit.clamp(0.0, 1.0);
        Duration::from_millis(jittered.round().max(1.0) as u64)
    }

    pub fn delay(&self, kind: FailureKind, attempt: u16) -> Duration {
        let unit = rand::rng().random_range(0.0..=1.0);
        self.delay_with_unit(kind, attempt, unit)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), RetryConfig::rate_limited())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        let transient = RetryConfig {
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.5,
        };
        let rate_limited = RetryConfig {
            max_attempts: 6,
            backoff_base_ms: 10_000,
            backoff_max_ms: 120_000,
            jitter_ratio: 0.5,
        };
        RetryPolicy::new(transient, rate_limited)
    }

    #[test]
    fn three_failures_fall_in_doubling_windows() {
        let policy = policy();
        let expected = [(500, 1_500), (1_000, 3_000), (2_000, 6_000)];
        for (attempt, (lo, hi)) in (1..=3).zip(expected) {
            for _ in 0..50 {
                let delay = policy
                    .delay(FailureKind::Transient, attempt)
                    .as_millis() as u64;
                assert!(
                    (lo..=hi).contains(&delay),
                    "attempt {attempt}: {delay}ms outside {lo}..={hi}"
                );
            }
        }
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = policy();
        assert_eq!(
            policy.base_delay(FailureKind::Transient, 30),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.delay_with_unit(FailureKind::Transient, 30, 1.0),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn rate_limited_track_is_longer() {
        let policy = policy();
        assert!(
            policy.base_delay(FailureKind::RateLimited, 1)
                > policy.base_delay(FailureKind::Transient, 1)
        );
        assert!(policy.should_retry(FailureKind::RateLimited, 5));
        assert!(!policy.should_retry(FailureKind::Transient, 4));
    }

    #[test]
    fn permanent_failures_never_retry() {
        assert!(!policy().should_retry(FailureKind::Permanent, 0));
    }
}
