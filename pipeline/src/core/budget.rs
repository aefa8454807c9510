//! Shared time budget helpers for stage calls.

use std::time::{Duration, Instant};

/// Timeout for the next gateway call: the per-call cap, clipped to the run deadline.
///
/// Returns `None` once the deadline has passed.
pub fn call_timeout(per_call: Duration, deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(per_call.min(remaining))
}

/// Linear backoff before retry `attempt` (1-indexed).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_cap_applies_when_deadline_is_far() {
        let timeout = call_timeout(
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(3600),
        );
        assert_eq!(timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn expired_deadline_yields_none() {
        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        assert_eq!(call_timeout(Duration::from_secs(5), past), None);
    }

    #[test]
    fn backoff_grows_linearly() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(300));
    }
}
