//! Classical three-state circuit breaker guarding the LLM pass (SPEC_FULL.md §4.6).

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Classification of an upstream failure (SPEC_FULL.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Network, timeout, 5xx, 429 — counts toward trip.
    Transient,
    /// 401/402/403 — does not trip the breaker.
    NonTransient,
}

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_COOLDOWN: Duration = Duration::from_secs(60);

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
    clock: SharedClock,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            clock,
        }
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether an LLM call is currently permitted; also handles the
    /// open -> half-open transition once the cooldown elapses.
    #[must_use]
    pub fn allow(&self) -> bool {
        let mut state = self.state_lock();
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                let now_ms = self.clock.now().timestamp_millis();
                if now_ms - opened_at >= OPEN_COOLDOWN.as_millis() as i64 {
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let mut state = self.state_lock();
        *state = CircuitState::Closed;
    }

    pub fn record_failure_with_category(&self, category: FailureCategory) {
        if matches!(category, FailureCategory::NonTransient) {
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= FAILURE_THRESHOLD {
            let mut state = self.state_lock();
            *state = CircuitState::Open;
            self.opened_at_ms.store(self.clock.now().timestamp_millis(), Ordering::Release);
        }
    }

    #[must_use]
    pub fn current_state(&self) -> CircuitState {
        *self.state_lock()
    }
}

/// Classify an HTTP-flavored status code for circuit-breaker accounting.
///
/// SPEC_FULL.md §4.4 calls out 401/402/429 explicitly as not counting toward
/// the breaker trip, which is narrower than §7's general taxonomy (429 is
/// listed there alongside 5xx as transient). The run dispatcher's own
/// breaker update follows the more specific §4.4 rule; see DESIGN.md.
#[must_use]
pub fn classify_status(status: u16) -> FailureCategory {
    match status {
        401 | 402 | 403 | 429 => FailureCategory::NonTransient,
        500..=599 => FailureCategory::Transient,
        _ => FailureCategory::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn trips_open_after_threshold_transient_failures() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(clock);
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_with_category(FailureCategory::Transient);
        }
        assert!(!breaker.allow());
    }

    #[test]
    fn non_transient_never_trips() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(clock);
        for _ in 0..20 {
            breaker.record_failure_with_category(FailureCategory::NonTransient);
        }
        assert!(breaker.allow());
    }

    #[test]
    fn success_resets_failure_counter() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(clock);
        for _ in 0..(FAILURE_THRESHOLD - 1) {
            breaker.record_failure_with_category(FailureCategory::Transient);
        }
        breaker.record_success();
        for _ in 0..(FAILURE_THRESHOLD - 1) {
            breaker.record_failure_with_category(FailureCategory::Transient);
        }
        assert!(breaker.allow());
    }
}
