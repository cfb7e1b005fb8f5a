use crate::constants::{CLIENT_MAX_RETRIES, CLIENT_RETRY_BASE_DELAY, OVERLOADED_MARKER};
use std::time::Duration;

/// Bounded retry with linear backoff: retry `n` waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(CLIENT_MAX_RETRIES, CLIENT_RETRY_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }

    pub fn allows(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Whether an error body or message says the model is overloaded.
pub fn is_overloaded_signal(text: &str) -> bool {
    text.to_ascii_lowercase().contains(OVERLOADED_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_overloaded_detection() {
        assert!(is_overloaded_signal(
            r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#
        ));
        assert!(is_overloaded_signal("Upstream overloaded: busy"));
        assert!(!is_overloaded_signal(r#"{"error":"Missing content","code":"VALIDATION_ERROR"}"#));
    }
}
