use std::time::Duration;

use crate::HandlerError;

/// What to do with a record whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send to the retry topic, eligible again after `delay`
    Retry { retry_count: u32, delay: Duration },
    /// Send to the dead-letter topic and move on
    DeadLetter { retry_count: u32 },
}

/// Retry budget with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    /// Attempts (first delivery included) before dead-lettering
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(5),
        }
    }
}

impl FailurePolicy {
    /// `previous_failures` is the retry count carried by the record (0 for a
    /// first delivery).
    pub fn decide(&self, previous_failures: u32, error: &HandlerError) -> Disposition {
        let retry_count = previous_failures.saturating_add(1);

        if !error.is_retryable() || retry_count >= self.max_retries {
            return Disposition::DeadLetter { retry_count };
        }

        Disposition::Retry {
            retry_count,
            delay: self.backoff(retry_count),
        }
    }

    /// base * 2^retry_count
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry_count.min(16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_then_dead_letter() {
        let policy = FailurePolicy::default();
        let err = HandlerError::retryable("db down");

        assert_eq!(
            policy.decide(0, &err),
            Disposition::Retry {
                retry_count: 1,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            policy.decide(1, &err),
            Disposition::Retry {
                retry_count: 2,
                delay: Duration::from_secs(20)
            }
        );
        assert_eq!(
            policy.decide(2, &err),
            Disposition::DeadLetter { retry_count: 3 }
        );
    }

    #[test]
    fn test_permanent_skips_retry() {
        let policy = FailurePolicy::default();
        assert_eq!(
            policy.decide(0, &HandlerError::permanent("bad payload")),
            Disposition::DeadLetter { retry_count: 1 }
        );
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert!(policy.backoff(u32::MAX) >= policy.backoff(16));
    }
}
