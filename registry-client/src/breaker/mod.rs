//! Per-operation circuit breaker with a sliding failure window.

mod group;

pub use group::{CircuitBreakerGroup, Protected};

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::clock::{Clock, SystemClock};
use crate::error::BreakerError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls go through; failures are counted.
    Closed,
    /// Calls are short-circuited to the fallback.
    Open,
    /// One trial call is allowed to probe recovery.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_ms` that open the circuit.
    pub max_failures: u32,
    /// Length of the failure counting window.
    pub window_ms: u64,
    /// Time the circuit stays open before a trial call.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window_ms: 60_000,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(max_failures: u32, window: Duration, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            window_ms: window.as_millis() as u64,
            reset_timeout_ms: reset_timeout.as_millis() as u64,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub operation_name: String,
    pub is_open: bool,
    pub state: CircuitState,
    pub current_failure_count: usize,
    pub max_failures: u32,
    pub window_ms: u64,
    /// Message of the most recent swallowed failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<i64>,
    next_attempt_at: i64,
    trial_in_flight: bool,
    last_failure: Option<String>,
}

impl BreakerState {
    fn prune(&mut self, now: i64, window_ms: i64) {
        while let Some(&oldest) = self.failures.front() {
            if now - oldest > window_ms {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Attempt,
    Trial,
    Reject,
}

/// Circuit breaker bound to a single operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                next_attempt_at: 0,
                trial_in_flight: false,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose reset timeout has elapsed still
    /// reports `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `op`, returning the fallback's result if the circuit is open or
    /// `op` fails. The failure itself is recorded, never returned.
    pub async fn execute<T, E, F, Fut, FB>(&self, op: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        FB: FnOnce() -> T,
    {
        match self.run(op).await {
            Some(value) => value,
            None => fallback(),
        }
    }

    /// Run `op` without a fallback. Open circuits and failures both surface
    /// as `ServiceUnavailable`.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run(op).await.ok_or_else(|| BreakerError::ServiceUnavailable {
            operation: self.name.clone(),
        })
    }

    async fn run<T, E, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let trial = match self.admit() {
            Admission::Reject => {
                tracing::debug!("Circuit {} open, short-circuiting", self.name);
                return None;
            }
            Admission::Attempt => false,
            Admission::Trial => true,
        };

        let mut guard = AttemptGuard { breaker: self, trial, settled: false };
        let result = op().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.on_success(trial);
                Some(value)
            }
            Err(e) => {
                tracing::debug!("Operation {} failed: {}", self.name, e);
                self.on_failure(trial, e.to_string());
                None
            }
        }
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now_millis();
        let mut s = self.state.lock();
        let current = s.state;

        match current {
            CircuitState::Closed => {
                s.prune(now, self.config.window_ms as i64);
                Admission::Attempt
            }
            CircuitState::Open if now >= s.next_attempt_at => {
                tracing::info!("Circuit {} half-open, allowing trial call", self.name);
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::Open => Admission::Reject,
            CircuitState::HalfOpen if s.trial_in_flight => Admission::Reject,
            CircuitState::HalfOpen => {
                s.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    fn on_success(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.trial_in_flight = false;
        s.failures.clear();
        s.last_failure = None;
        tracing::info!("Circuit {} closed after successful trial", self.name);
    }

    fn on_failure(&self, trial: bool, error: String) {
        let now = self.clock.now_millis();
        let reopen_at = now.saturating_add(self.config.reset_timeout_ms as i64);
        let mut s = self.state.lock();
        s.last_failure = Some(error);

        if trial {
            s.trial_in_flight = false;
            s.failures.push_back(now);
            s.state = CircuitState::Open;
            s.next_attempt_at = reopen_at;
            tracing::warn!("Circuit {} trial failed, reopening", self.name);
            return;
        }

        // A call admitted while closed may finish after another call opened the circuit
        if s.state != CircuitState::Closed {
            return;
        }

        s.prune(now, self.config.window_ms as i64);
        s.failures.push_back(now);
        if s.failures.len() >= self.config.max_failures as usize {
            s.state = CircuitState::Open;
            s.next_attempt_at = reopen_at;
            tracing::warn!(
                "Circuit {} opened after {} failures within {}ms",
                self.name,
                s.failures.len(),
                self.config.window_ms
            );
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let now = self.clock.now_millis();
        let window_ms = self.config.window_ms as i64;
        let s = self.state.lock();

        BreakerStatus {
            operation_name: self.name.clone(),
            is_open: s.state != CircuitState::Closed,
            state: s.state,
            current_failure_count: s.failures.iter().filter(|&&t| now - t <= window_ms).count(),
            max_failures: self.config.max_failures,
            window_ms: self.config.window_ms,
            last_failure: s.last_failure.clone(),
        }
    }

    /// Force the circuit closed and forget recorded failures.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.trial_in_flight = false;
        s.failures.clear();
        s.last_failure = None;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Settles a trial whose future was dropped before completing, so the
/// circuit cannot stay half-open forever.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true, "trial call cancelled".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use shared::clock::ManualClock;

    fn test_breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        let config = CircuitBreakerConfig::new(3, Duration::from_secs(10), Duration::from_secs(5));
        CircuitBreaker::with_clock("get_user", config, clock)
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> &'static str {
        breaker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>("connection refused")
                },
                || "fallback",
            )
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> &'static str {
        breaker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("real")
                },
                || "fallback",
            )
            .await
    }

    async fn open_breaker(breaker: &CircuitBreaker, clock: &ManualClock, calls: &AtomicUsize) {
        fail(breaker, calls).await;
        clock.advance_secs(1);
        fail(breaker, calls).await;
        clock.advance_secs(1);
        fail(breaker, calls).await;
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert_eq!(fail(&breaker, &calls).await, "fallback");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_operation() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;

        clock.set(2_500);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not call the operation");
    }

    #[tokio::test]
    async fn test_successful_trial_closes() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;

        // Opened at t=2s; trial allowed from t=7s
        clock.set(6_999);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        clock.set(7_000);
        assert_eq!(succeed(&breaker, &calls).await, "real");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().current_failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;
        clock.set(7_000);

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let trial_calls = &calls;
        let trial = breaker.execute(
            move || async move {
                trial_calls.fetch_add(1, Ordering::SeqCst);
                gate.await.map(|_| "trial").map_err(|e| e.to_string())
            },
            || "fallback",
        );
        let concurrent = async {
            let answer = succeed(&breaker, &calls).await;
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
            let _ = release.send(());
            answer
        };

        let (trial_answer, concurrent_answer) = tokio::join!(trial, concurrent);
        assert_eq!(concurrent_answer, "fallback");
        assert_eq!(trial_answer, "trial");
        assert_eq!(calls.load(Ordering::SeqCst), 4, "only the trial reaches the operation");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_with_fresh_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;

        clock.set(7_000);
        assert_eq!(fail(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.set(11_999);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        clock.set(12_000);
        assert_eq!(succeed(&breaker, &calls).await, "real");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_pruned() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;

        clock.advance_millis(10_001);
        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().current_failure_count, 1);
    }

    #[tokio::test]
    async fn test_success_while_closed_keeps_window() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await;
        fail(&breaker, &calls).await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_without_fallback() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock);

        let ok = breaker.call(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(ok, Ok(42));

        let err = breaker.call(|| async { Err::<u32, _>("boom") }).await;
        assert_eq!(
            err,
            Err(BreakerError::ServiceUnavailable { operation: "get_user".to_string() })
        );

        let status = breaker.status();
        assert_eq!(status.last_failure.as_deref(), Some("boom"));
        assert_eq!(status.current_failure_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_reopens() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;
        clock.set(7_000);

        let stalled = breaker.execute(
            || std::future::pending::<Result<&str, String>>(),
            || "fallback",
        );
        assert!(tokio::time::timeout(Duration::from_millis(20), stalled).await.is_err());

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");

        clock.set(12_000);
        assert_eq!(succeed(&breaker, &calls).await, "real");
    }

    #[tokio::test]
    async fn test_reset_closes_and_forgets() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);

        open_breaker(&breaker, &clock, &calls).await;
        breaker.reset();

        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.current_failure_count, 0);
        assert!(status.last_failure.is_none());
        assert_eq!(succeed(&breaker, &calls).await, "real");
    }

    #[tokio::test]
    async fn test_status_shape() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = test_breaker(clock.clone());
        let calls = AtomicUsize::new(0);
        open_breaker(&breaker, &clock, &calls).await;

        let json = serde_json::to_value(breaker.status()).unwrap();
        assert_eq!(json["operationName"], "get_user");
        assert_eq!(json["isOpen"], true);
        assert_eq!(json["state"], "open");
        assert_eq!(json["currentFailureCount"], 3);
        assert_eq!(json["maxFailures"], 3);
        assert_eq!(json["windowMs"], 10_000);
        assert_eq!(json["lastFailure"], "connection refused");
    }
}
