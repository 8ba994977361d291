//! Reconnect backoff as an immutable value
//!
//! Backoff state is threaded explicitly through the coordinator instead of
//! mutated on shared objects, so the delay schedule is independently
//! testable.

use std::time::Duration;

/// One step of the exponential reconnect schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Consecutive failed reconnect attempts so far
    pub attempt: u32,
    /// Delay before the next attempt, in milliseconds
    pub next_delay_ms: u64,
}

impl Backoff {
    /// Schedule before any attempt has failed
    pub fn initial(base_ms: u64, max_ms: u64) -> Self {
        Self {
            attempt: 0,
            next_delay_ms: delay_for_attempt(0, base_ms, max_ms),
        }
    }

    /// The schedule after one more failed attempt
    pub fn advance(self, base_ms: u64, max_ms: u64) -> Self {
        let attempt = self.attempt.saturating_add(1);
        Self {
            attempt,
            next_delay_ms: delay_for_attempt(attempt, base_ms, max_ms),
        }
    }

    pub fn next_delay(&self) -> Duration {
        Duration::from_millis(self.next_delay_ms)
    }

    /// Whether the retry budget is spent
    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.attempt >= max_retries
    }
}

/// `delay = min(max, base * 2^attempt)`
pub fn delay_for_attempt(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_doubles_then_caps() {
        let mut backoff = Backoff::initial(2_000, 60_000);
        let mut delays = vec![backoff.next_delay_ms];
        for _ in 0..6 {
            backoff = backoff.advance(2_000, 60_000);
            delays.push(backoff.next_delay_ms);
        }
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        assert_eq!(delay_for_attempt(200, 2_000, 60_000), 60_000);
        let backoff = Backoff {
            attempt: u32::MAX,
            next_delay_ms: 0,
        };
        assert_eq!(backoff.advance(2_000, 60_000).next_delay_ms, 60_000);
    }

    #[test]
    fn exhaustion_uses_the_attempt_counter() {
        let backoff = Backoff::initial(2_000, 60_000);
        assert!(!backoff.exhausted(5));
        let spent = (0..5).fold(backoff, |b, _| b.advance(2_000, 60_000));
        assert!(spent.exhausted(5));
    }
}
