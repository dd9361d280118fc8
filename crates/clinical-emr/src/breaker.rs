//! Circuit Breaker + Retry (C7, §4.7): per-endpoint failure isolation so a
//! degraded EMR system doesn't exhaust the caller with hung network calls.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Circuit breaker phase for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open { opened_at_ns: u64 },
    HalfOpen,
}

struct EndpointState {
    phase: Phase,
    consecutive_failures: u32,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Errors surfaced by [`CircuitBreaker::guard`].
#[derive(Debug, Error, Clone)]
pub enum BreakerError<E> {
    #[error("circuit open for {endpoint}")]
    Open { endpoint: String },
    #[error(transparent)]
    Inner(#[from] E),
}

/// Per-endpoint `closed -> open -> half-open -> closed` state machine
/// (§4.7): failure threshold 5, reset timeout 30s, one half-open probe.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, EndpointState>>,
    failure_threshold: u32,
    reset_timeout_ns: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout_ns: u64) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            failure_threshold,
            reset_timeout_ns,
        }
    }

    /// Whether a call to `endpoint` may proceed right now. A half-open
    /// probe is consumed by flipping the phase to `HalfOpen` as a side
    /// effect, so only one concurrent caller gets to probe.
    fn admit(&self, endpoint: &str, now_ns: u64) -> bool {
        let mut states = self.states.write();
        let state = states.entry(endpoint.to_string()).or_default();
        match state.phase {
            Phase::Closed => true,
            Phase::HalfOpen => false,
            Phase::Open { opened_at_ns } => {
                if now_ns.saturating_sub(opened_at_ns) >= self.reset_timeout_ns {
                    tracing::info!(endpoint, "circuit half-open probe admitted");
                    state.phase = Phase::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, endpoint: &str) {
        let mut states = self.states.write();
        let state = states.entry(endpoint.to_string()).or_default();
        if state.phase != Phase::Closed {
            tracing::info!(endpoint, "circuit closed after successful probe");
        }
        state.phase = Phase::Closed;
        state.consecutive_failures = 0;
    }

    fn on_failure(&self, endpoint: &str, now_ns: u64) {
        let mut states = self.states.write();
        let state = states.entry(endpoint.to_string()).or_default();
        match state.phase {
            Phase::HalfOpen => {
                tracing::warn!(endpoint, "half-open probe failed, reopening circuit");
                state.phase = Phase::Open { opened_at_ns: now_ns };
                state.consecutive_failures = self.failure_threshold;
            }
            _ => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(endpoint, failures = state.consecutive_failures, "circuit opened");
                    state.phase = Phase::Open { opened_at_ns: now_ns };
                }
            }
        }
    }

    /// Run `op` guarded by this breaker's state for `endpoint`. Short-
    /// circuits with `BreakerError::Open` without calling `op` at all when
    /// the circuit is open.
    pub async fn guard<T, E, Fut>(
        &self,
        endpoint: &str,
        now_ns: u64,
        op: impl FnOnce() -> Fut,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit(endpoint, now_ns) {
            return Err(BreakerError::Open {
                endpoint: endpoint.to_string(),
            });
        }
        match op().await {
            Ok(value) => {
                self.on_success(endpoint);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(endpoint, now_ns);
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// Retry an operation with exponential backoff (§4.7: base 100ms, cap 5s,
/// up to 3 attempts), retrying only while `is_retryable` holds.
pub async fn retry_with_backoff<T, E>(
    mut op: impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<T, E>> + Send>>,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E> {
    let mut attempt = 0;
    let mut delay = base;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts || !is_retryable(&err) => return Err(err),
            Err(_err) => {
                tracing::debug!(attempt, "retrying after failure");
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const SECOND_NS: u64 = 1_000_000_000;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, 30 * SECOND_NS);
        for i in 0..5 {
            let result: Result<(), BreakerError<&str>> =
                breaker.guard("fhir", i, || async { Err("boom") }).await;
            assert!(result.is_err());
        }
        let result: Result<(), BreakerError<&str>> =
            breaker.guard("fhir", 5, || async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_after_reset_timeout() {
        let breaker = CircuitBreaker::new(1, 30 * SECOND_NS);
        let _: Result<(), BreakerError<&str>> = breaker.guard("fhir", 0, || async { Err("boom") }).await;
        // Still within reset window: short-circuited.
        let still_open: Result<(), BreakerError<&str>> =
            breaker.guard("fhir", SECOND_NS, || async { Ok(()) }).await;
        assert!(matches!(still_open, Err(BreakerError::Open { .. })));

        // Past the reset window: one probe admitted and it succeeds.
        let probe: Result<(), BreakerError<&str>> =
            breaker.guard("fhir", 31 * SECOND_NS, || async { Ok(()) }).await;
        assert!(probe.is_ok());

        // Circuit is closed again.
        let after: Result<(), BreakerError<&str>> =
            breaker.guard("fhir", 32 * SECOND_NS, || async { Ok(()) }).await;
        assert!(after.is_ok());
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_on_non_retryable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_ref = attempts.clone();
        let result: Result<(), &str> = retry_with_backoff(
            move || {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err("permanent") })
            },
            Duration::from_millis(1),
            Duration::from_millis(10),
            3,
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_with_backoff_exhausts_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_ref = attempts.clone();
        let result: Result<(), &str> = retry_with_backoff(
            move || {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err("transient") })
            },
            Duration::from_millis(1),
            Duration::from_millis(10),
            3,
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
