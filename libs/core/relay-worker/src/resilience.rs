//! Circuit breaker guarding calls to one named dependency.
//!
//! ## Circuit Breaker States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <─────────┐
//! └─────────┘                         └────────┘           │
//!      ^                                   │               │
//!      │                                   │ reset timeout │
//!      │                                   │ elapsed (CAS) │ any failure
//!      │   probe successes >= threshold    v               │
//!      └──────────────────────────── ┌─────────────┐       │
//!                                    │ HALF-OPEN   │ ──────┘
//!                                    └─────────────┘
//! ```
//!
//! State and both counters share one atomic word. Every change is a single
//! `fetch_update` on that word, so when several workers race on the same
//! breaker exactly one of them performs a given transition and no reader
//! ever sees a state paired with counters from another state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_worker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("liquidity", CircuitBreakerConfig::default());
//!
//! if breaker.allow_request() {
//!     match call_dependency().await {
//!         Ok(_) => breaker.record_success(),
//!         Err(_) => breaker.record_failure(),
//!     }
//! } else {
//!     // Circuit is open, fail fast
//! }
//! ```

use metrics::{counter, gauge};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// Probing whether the dependency has recovered.
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker. Immutable once the breaker exists.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open state before closing.
    pub success_threshold: u32,
    /// How long to stay open after the last failure before probing.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold for half-open state.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Outcome of asking the breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed or half-open: go ahead.
    Allowed,
    /// This caller moved the breaker from open to half-open and is the probe.
    Probe,
    /// Open and still cooling down.
    Rejected,
}

impl Admission {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Point-in-time view of a breaker, for reporters.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_successes: u32,
}

/// Decoded view of the packed breaker word.
///
/// Layout: bits 0..8 state, 8..32 half-open successes, 32..64 consecutive
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word {
    state: CircuitState,
    probes: u32,
    failures: u32,
}

impl Word {
    const PROBE_MASK: u64 = 0x00FF_FFFF;

    fn new(state: CircuitState) -> Self {
        Self {
            state,
            probes: 0,
            failures: 0,
        }
    }

    fn pack(self) -> u64 {
        u64::from(self.state.as_u8())
            | (u64::from(self.probes) & Self::PROBE_MASK) << 8
            | u64::from(self.failures) << 32
    }

    fn unpack(raw: u64) -> Self {
        Self {
            state: CircuitState::from_u8((raw & 0xFF) as u8),
            probes: ((raw >> 8) & Self::PROBE_MASK) as u32,
            failures: (raw >> 32) as u32,
        }
    }
}

/// Lock-free circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    word: AtomicU64,
    /// Milliseconds since `epoch` of the last failure, 0 if none yet.
    last_failure_ms: AtomicU64,
    epoch: Instant,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.load();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &word.state)
            .field("failures", &word.failures)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            word: AtomicU64::new(Word::new(CircuitState::Closed).pack()),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        };
        breaker.publish_state(CircuitState::Closed);
        breaker
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was built with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        self.load().state
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.load().failures
    }

    /// Consecutive successes recorded while half-open.
    pub fn probe_success_count(&self) -> u32 {
        self.load().probes
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let word = self.load();
        BreakerSnapshot {
            name: self.name.clone(),
            state: word.state,
            consecutive_failures: word.failures,
            probe_successes: word.probes,
        }
    }

    /// Check if a request can be executed.
    ///
    /// Only side effect: the open to half-open transition once the reset
    /// timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        self.admit().is_allowed()
    }

    /// Like [`allow_request`](Self::allow_request) but tells the caller
    /// whether it performed the open to half-open transition.
    pub fn admit(&self) -> Admission {
        if self.state() != CircuitState::Open {
            return Admission::Allowed;
        }
        if !self.reset_timeout_elapsed() {
            return Admission::Rejected;
        }
        let step = |word: Word| {
            (word.state == CircuitState::Open).then(|| Word::new(CircuitState::HalfOpen))
        };
        match self.update(step) {
            Some(_) => {
                info!(breaker = %self.name, "Circuit breaker HALF-OPEN (testing recovery)");
                Admission::Probe
            }
            // Lost the race; whoever won already moved us on.
            None => Admission::Allowed,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let threshold = self.config.success_threshold;
        let step = |word: Word| match word.state {
            CircuitState::Closed if word.failures > 0 => Some(Word::new(CircuitState::Closed)),
            CircuitState::HalfOpen if word.probes + 1 >= threshold => {
                Some(Word::new(CircuitState::Closed))
            }
            CircuitState::HalfOpen => Some(Word {
                probes: word.probes + 1,
                ..word
            }),
            // Closed with nothing to reset, or a call admitted before the
            // breaker opened; it proves nothing.
            _ => None,
        };
        if let Some((before, after)) = self.update(step)
            && before.state == CircuitState::HalfOpen
            && after.state == CircuitState::Closed
        {
            info!(
                breaker = %self.name,
                successes = before.probes + 1,
                "Circuit breaker CLOSED (recovered)"
            );
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.last_failure_ms
            .store(self.elapsed_ms().max(1), Ordering::Release);

        let threshold = self.config.failure_threshold;
        let step = |word: Word| match word.state {
            CircuitState::Closed => {
                let failures = word.failures.saturating_add(1);
                Some(if failures >= threshold {
                    Word {
                        failures,
                        ..Word::new(CircuitState::Open)
                    }
                } else {
                    Word { failures, ..word }
                })
            }
            CircuitState::HalfOpen => Some(Word::new(CircuitState::Open)),
            CircuitState::Open => None,
        };
        match self.update(step) {
            Some((before, after))
                if before.state == CircuitState::Closed && after.state == CircuitState::Open =>
            {
                warn!(
                    breaker = %self.name,
                    failures = after.failures,
                    "Circuit breaker OPENED"
                );
            }
            Some((before, _)) if before.state == CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit breaker re-OPENED from half-open");
            }
            _ => {}
        }
    }

    fn load(&self) -> Word {
        Word::unpack(self.word.load(Ordering::Acquire))
    }

    /// Applies `step` atomically. `step` must be pure: it is re-run on the
    /// winning value to recover the word that was stored.
    fn update(&self, step: impl Fn(Word) -> Option<Word>) -> Option<(Word, Word)> {
        let raw = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                step(Word::unpack(raw)).map(Word::pack)
            })
            .ok()?;
        let before = Word::unpack(raw);
        let after = step(before)?;
        if before.state != after.state {
            counter!(
                "relay_circuit_breaker_transitions_total",
                "breaker" => self.name.clone(),
                "state" => after.state.as_str()
            )
            .increment(1);
            self.publish_state(after.state);
        }
        Some((before, after))
    }

    fn publish_state(&self, state: CircuitState) {
        gauge!("relay_circuit_breaker_state", "breaker" => self.name.clone())
            .set(f64::from(state.as_u8()));
    }

    fn reset_timeout_elapsed(&self) -> bool {
        let last = self.last_failure_ms.load(Ordering::Acquire);
        let since = self.elapsed_ms().saturating_sub(last);
        Duration::from_millis(since) >= self.config.reset_timeout
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn breaker(failures: u32, successes: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_reset_timeout(reset),
        )
    }

    fn open_and_wait(b: &CircuitBreaker) {
        while b.state() != CircuitState::Open {
            b.record_failure();
        }
        thread::sleep(b.config().reset_timeout + Duration::from_millis(5));
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
        assert_eq!(breaker.name(), "test");
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        for threshold in 1..=6 {
            let b = breaker(threshold, 1, Duration::from_secs(60));
            for _ in 0..threshold - 1 {
                b.record_failure();
                assert_eq!(b.state(), CircuitState::Closed);
            }
            b.record_failure();
            assert_eq!(b.state(), CircuitState::Open, "threshold {threshold}");
            assert!(!b.allow_request());
        }
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let b = breaker(3, 1, Duration::from_secs(60));

        b.record_failure();
        b.record_failure();
        assert_eq!(b.failure_count(), 2);

        b.record_success();
        assert_eq!(b.failure_count(), 0);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_reset_timeout() {
        let b = breaker(1, 1, Duration::from_millis(50));
        b.record_failure();

        assert_eq!(b.admit(), Admission::Rejected);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(b.admit(), Admission::Rejected);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(b.admit(), Admission::Probe);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_probe_successes() {
        let b = breaker(1, 2, Duration::from_millis(10));
        open_and_wait(&b);

        assert!(b.allow_request());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.probe_success_count(), 1);

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.probe_success_count(), 0);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_half_open_reopens_on_single_failure() {
        let b = breaker(1, 3, Duration::from_millis(10));
        open_and_wait(&b);
        b.admit();

        b.record_success();
        assert_eq!(b.probe_success_count(), 1);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.probe_success_count(), 0);
        assert_eq!(b.failure_count(), 0);
        // The reopen restarts the cool-down.
        assert!(!b.allow_request());
    }

    #[test]
    fn test_success_while_open_is_ignored() {
        let b = breaker(1, 1, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_exactly_one_caller_observes_half_open_transition() {
        let b = Arc::new(breaker(1, 1, Duration::from_millis(10)));
        open_and_wait(&b);

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let b = Arc::clone(&b);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    b.admit()
                })
            })
            .collect();

        let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let probes = admissions.iter().filter(|a| **a == Admission::Probe).count();

        assert_eq!(probes, 1);
        assert!(admissions.iter().all(Admission::is_allowed));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let b = Arc::new(breaker(10, 1, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                thread::spawn(move || {
                    for _ in 0..50 {
                        b.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.probe_success_count(), 0);
    }

    #[test]
    fn test_snapshot_reports_state() {
        let b = breaker(2, 1, Duration::from_secs(60));
        b.record_failure();

        let snap = b.snapshot();
        assert_eq!(snap.name, "test");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "closed");
    }

    #[test]
    fn test_word_packing() {
        let word = Word {
            state: CircuitState::HalfOpen,
            probes: 7,
            failures: u32::MAX,
        };
        assert_eq!(Word::unpack(word.pack()), word);
        assert_eq!(Word::unpack(0), Word::new(CircuitState::Closed));
    }

    #[test]
    fn test_mixed_concurrent_outcomes_never_pair_state_with_stale_counters() {
        let b = Arc::new(breaker(3, 2, Duration::ZERO));
        let stop = Arc::new(AtomicBool::new(false));

        let observer = {
            let b = Arc::clone(&b);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut violations = Vec::new();
                while !stop.load(Ordering::Acquire) {
                    let snap = b.snapshot();
                    let consistent = match snap.state {
                        CircuitState::Closed => {
                            snap.probe_successes == 0 && snap.consecutive_failures < 3
                        }
                        CircuitState::HalfOpen => {
                            snap.consecutive_failures == 0 && snap.probe_successes < 2
                        }
                        CircuitState::Open => snap.probe_successes == 0,
                    };
                    if !consistent {
                        violations.push(snap);
                    }
                }
                violations
            })
        };

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let b = Arc::clone(&b);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..5_000 {
                        b.admit();
                        if (t + i) % 3 == 0 {
                            b.record_failure();
                        } else {
                            b.record_success();
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Release);

        let violations = observer.join().unwrap();
        assert!(violations.is_empty(), "inconsistent snapshots: {violations:?}");
    }
}
