//! Retry policy: decides when a failed request comes back.

use std::time::Duration;

use tokio::time::Instant;

/// Fixed-period retry policy.
///
/// Retries are unbounded in count and never back off or jitter: every
/// failure waits exactly `period` before the request rejoins the tail of
/// the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub period: Duration,
}

impl RetryPolicy {
    pub fn fixed(period: Duration) -> Self {
        Self { period }
    }

    /// Deadline for a request that failed at `now`.
    pub fn next_run_at(&self, now: Instant) -> Instant {
        now + self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_at_adds_period() {
        let policy = RetryPolicy::fixed(Duration::from_millis(300));
        let now = Instant::now();
        assert_eq!(policy.next_run_at(now), now + Duration::from_millis(300));
        // 何回失敗しても同じ間隔
        let later = now + Duration::from_secs(10);
        assert_eq!(policy.next_run_at(later), later + Duration::from_millis(300));
    }
}
