// Per-process circuit breaker guarding calls into a distributed store.
// Shared by the revocation index (C1) and, optionally, any other
// subsystem whose backing store needs fail-fast protection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitEntry {
    state: CircuitState,
    opened_at: Instant,
    failure_count: u32,
    half_open_trial_in_flight: bool,
}

impl CircuitEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: Instant::now(),
            failure_count: 0,
            half_open_trial_in_flight: false,
        }
    }
}

/// `threshold` consecutive failures open the circuit; it stays open for
/// `open_for`, then moves to half-open for `half_open_for` before a
/// success closes it again. State is keyed by an arbitrary service name so
/// one breaker instance can guard several backing stores.
pub struct CircuitBreaker {
    state: Mutex<HashMap<String, CircuitEntry>>,
    failure_threshold: u32,
    open_for: Duration,
    half_open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration, half_open_for: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            failure_threshold,
            open_for,
            half_open_for,
        }
    }

    /// `true` while the breaker is blocking calls for `service`. An open
    /// circuit transitions itself to half-open once `open_for` has elapsed
    /// and lets exactly one trial call through (returns `false` for that
    /// call only); concurrent callers during the trial still see `true`.
    pub fn is_open(&self, service: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry = match state.get_mut(service) {
            Some(entry) => entry,
            None => return false,
        };

        match entry.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if entry.opened_at.elapsed() < self.open_for {
                    true
                } else {
                    tracing::info!(service, "circuit breaker half-open, admitting trial call");
                    entry.state = CircuitState::HalfOpen;
                    entry.opened_at = Instant::now();
                    entry.half_open_trial_in_flight = true;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_trial_in_flight {
                    true
                } else if entry.opened_at.elapsed() < self.half_open_for {
                    entry.half_open_trial_in_flight = true;
                    false
                } else {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Instant::now();
                    true
                }
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let mut state = self.state.lock().unwrap();
        state.insert(service.to_string(), CircuitEntry::closed());
    }

    pub fn record_failure(&self, service: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entry(service.to_string())
            .or_insert_with(CircuitEntry::closed);

        if entry.state == CircuitState::HalfOpen {
            tracing::warn!(service, "circuit breaker trial call failed, reopening");
            entry.state = CircuitState::Open;
            entry.opened_at = Instant::now();
            entry.half_open_trial_in_flight = false;
            return;
        }

        entry.failure_count += 1;
        if entry.failure_count >= self.failure_threshold {
            if entry.state != CircuitState::Open {
                tracing::warn!(service, failures = entry.failure_count, "circuit breaker opened");
            }
            entry.state = CircuitState::Open;
            entry.opened_at = Instant::now();
        }
    }

    pub fn current_state(&self, service: &str) -> CircuitState {
        let state = self.state.lock().unwrap();
        state
            .get(service)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_until_threshold_reached() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_secs(30));

        assert!(!cb.is_open("revocation_store"));
        cb.record_failure("revocation_store");
        cb.record_failure("revocation_store");
        assert!(!cb.is_open("revocation_store"));

        cb.record_failure("revocation_store");
        assert!(cb.is_open("revocation_store"));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_secs(30));
        cb.record_failure("svc");
        cb.record_failure("svc");
        cb.record_success("svc");
        cb.record_failure("svc");
        assert!(!cb.is_open("svc"));
    }

    #[test]
    fn independent_per_service() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60), Duration::from_secs(30));
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(!cb.is_open("b"));
    }

    #[test]
    fn half_open_admits_one_trial_then_closes_on_success() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20), Duration::from_millis(200));
        cb.record_failure("svc");
        assert!(cb.is_open("svc"));

        std::thread::sleep(Duration::from_millis(25));
        assert!(!cb.is_open("svc"));
        assert_eq!(cb.current_state("svc"), CircuitState::HalfOpen);
        assert!(cb.is_open("svc"));

        cb.record_success("svc");
        assert_eq!(cb.current_state("svc"), CircuitState::Closed);
        assert!(!cb.is_open("svc"));
    }

    #[test]
    fn half_open_trial_failure_reopens_circuit() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20), Duration::from_millis(200));
        cb.record_failure("svc");
        std::thread::sleep(Duration::from_millis(25));
        assert!(!cb.is_open("svc"));

        cb.record_failure("svc");
        assert_eq!(cb.current_state("svc"), CircuitState::Open);
        assert!(cb.is_open("svc"));
    }
}
