use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::Failure;

/// Retry policy for activities and local activities.
///
/// `do_not_retry` is matched against `ApplicationFailure::error_type`;
/// a match stops retrying regardless of remaining attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Option<Duration>,
    /// 0 means unlimited.
    pub maximum_attempts: u32,
    pub do_not_retry: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(100)),
            maximum_attempts: 0,
            do_not_retry: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, or `None` when the failure must not
    /// be retried. `attempt` is the 1-based number of attempts already made.
    pub fn next_delay(&self, attempt: u32, failure: &Failure) -> Option<Duration> {
        if !failure.retryable() {
            return None;
        }
        if let Some(app) = failure.application_cause() {
            if self.do_not_retry.iter().any(|t| t == &app.error_type) {
                return None;
            }
        }
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts {
            return None;
        }
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self.initial_interval.mul_f64(factor.max(1.0));
        if let Some(max) = self.maximum_interval {
            delay = delay.min(max);
        }
        Some(delay)
    }
}
