//! Retry policy applied to provider attempts.

use std::collections::HashSet;
use std::time::Duration;

use autoflow_types::{ProviderErrorKind, StepErrorPolicy};
use autoflow_util::RetrySettings;
use tracing::warn;

/// Bounded exponential backoff over a set of retriable failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_on: HashSet<ProviderErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        let retry_on = settings
            .retry_on
            .iter()
            .filter_map(|name| match serde_json::from_value(serde_json::Value::String(name.clone())) {
                Ok(kind) => Some(kind),
                Err(_) => {
                    warn!(kind = %name, "ignoring unknown retriable error kind");
                    None
                }
            })
            .collect();
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            retry_on,
        }
    }

    /// No retries at all.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on: HashSet::new(),
        }
    }

    /// Apply a step's `on_error` overrides.
    pub fn with_overrides(&self, policy: Option<&StepErrorPolicy>) -> Self {
        let mut effective = self.clone();
        let Some(policy) = policy else {
            return effective;
        };
        if let Some(max_attempts) = policy.max_attempts {
            effective.max_attempts = max_attempts.max(1);
        }
        if let Some(base) = policy.backoff_base_ms {
            effective.base_delay = Duration::from_millis(base);
        }
        if let Some(max) = policy.backoff_max_ms {
            effective.max_delay = Duration::from_millis(max);
        }
        effective
    }

    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a failure of `kind` on attempt `attempt` earns another attempt.
    ///
    /// Authentication and rejected failures are never retried.
    pub fn should_retry(&self, kind: ProviderErrorKind, attempt: u32) -> bool {
        if matches!(kind, ProviderErrorKind::Authentication | ProviderErrorKind::Rejected) {
            return false;
        }
        attempt < self.max_attempts && self.retry_on.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_retry_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.retry_on.contains(&ProviderErrorKind::Timeout));
        assert!(!policy.retry_on.contains(&ProviderErrorKind::Rejected));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            retry_on: HashSet::new(),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(64), Duration::from_millis(500));
    }

    #[test]
    fn retry_decisions_respect_cap_and_kind() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ProviderErrorKind::Transient, 1));
        assert!(policy.should_retry(ProviderErrorKind::RateLimited, 2));
        assert!(!policy.should_retry(ProviderErrorKind::Transient, 3));
        assert!(!policy.should_retry(ProviderErrorKind::Authentication, 1));
        assert!(!policy.should_retry(ProviderErrorKind::Rejected, 1));
    }

    #[test]
    fn step_overrides_replace_selected_fields() {
        let policy = RetryPolicy::default().with_overrides(Some(&StepErrorPolicy {
            max_attempts: Some(0),
            backoff_base_ms: Some(10),
            ..Default::default()
        }));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
    }

    #[test]
    fn unknown_kinds_in_settings_are_ignored() {
        let settings = RetrySettings {
            retry_on: vec!["transient".into(), "cosmic_rays".into()],
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.retry_on, HashSet::from([ProviderErrorKind::Transient]));
    }
}
