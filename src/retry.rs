//! Bounded retry with exponential backoff for transient build failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exit code conventionally used for "temporary failure, try again".
pub const EX_TEMPFAIL: i32 = 75;

pub fn default_network_error_patterns() -> Vec<String> {
    [
        "ECONNRESET",
        "ETIMEDOUT",
        "EAI_AGAIN",
        "ENOTFOUND",
        "network timeout",
        "Could not resolve host",
        "socket hang up",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Which failures are retried, how often, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry
    pub base_delay: Duration,
    pub retryable_exit_codes: Vec<i32>,
    /// Substrings of build output that indicate a dependency fetch failed
    pub network_error_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            retryable_exit_codes: vec![EX_TEMPFAIL],
            network_error_patterns: default_network_error_patterns(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_retryable_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.retryable_exit_codes = codes;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether a failed step with this exit code and output is worth retrying.
    pub fn is_transient(&self, exit_code: Option<i32>, output: &str) -> bool {
        if exit_code.is_some_and(|c| self.retryable_exit_codes.contains(&c)) {
            return true;
        }
        self.network_error_patterns
            .iter()
            .any(|p| !p.is_empty() && output.contains(p.as_str()))
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_exit_code_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_transient(Some(EX_TEMPFAIL), ""));
        assert!(!policy.is_transient(Some(1), "error TS2304: Cannot find name"));
        assert!(!policy.is_transient(None, ""));
    }

    #[test]
    fn test_network_failure_in_output() {
        let policy = RetryPolicy::default();
        let npm = "npm ERR! code ECONNRESET\nnpm ERR! network aborted";
        assert!(policy.is_transient(Some(1), npm));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
