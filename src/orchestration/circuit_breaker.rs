//! Call guard that stops invoking a repeatedly failing operation.
//!
//! CLOSED lets every call through and counts consecutive failures. Reaching
//! the threshold opens the breaker: calls are rejected without being run
//! until `reset_timeout` has passed, after which a single trial call is let
//! through (HALF_OPEN). The trial's outcome closes or re-opens the breaker.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::BreakerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub successes: u32,
    pub failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    successes: u32,
    failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            successes: 0,
            failures: 0,
            last_success: None,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Clears the half-open trial flag if the trial future is dropped mid-flight.
struct TrialGuard<'a> {
    inner: &'a Mutex<Inner>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().unwrap().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::closed()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Run `operation` if the breaker allows it, recording the outcome.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = self.admit::<E>()?;
        let mut guard = TrialGuard {
            inner: &self.inner,
            armed: trial,
        };

        let outcome = operation().await;

        let mut inner = self.inner.lock().unwrap();
        guard.armed = false;
        inner.trial_in_flight = false;
        match outcome {
            Ok(value) => {
                self.on_success(&mut inner);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&mut inner);
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Force CLOSED with both counters zeroed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        let last_success = inner.last_success;
        let last_failure = inner.last_failure;
        *inner = Inner::closed();
        inner.last_success = last_success;
        inner.last_failure = last_failure;
        tracing::info!("Circuit breaker manually reset");
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state,
            successes: inner.successes,
            failures: inner.failures,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
        }
    }

    /// Decide whether a call may run. Returns true when it is the half-open trial.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed < self.config.reset_timeout {
                    return Err(BreakerError::Open {
                        retry_after: self.config.reset_timeout - elapsed,
                    });
                }
                tracing::info!("Circuit breaker half-open; allowing a trial call");
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(true)
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(BreakerError::TrialInFlight);
                }
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, inner: &mut Inner) {
        inner.last_success = Some(Utc::now());
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::info!("Circuit breaker closed after successful trial");
                inner.state = BreakerState::Closed;
                inner.successes = 0;
                inner.failures = 0;
                inner.opened_at = None;
            }
            _ => {
                inner.successes += 1;
                inner.failures = 0;
            }
        }
    }

    fn on_failure(&self, inner: &mut Inner) {
        inner.last_failure = Some(Utc::now());
        inner.failures += 1;
        inner.successes = 0;
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            _ => inner.failures >= self.config.failure_threshold,
        };
        if trip && inner.state != BreakerState::Open {
            tracing::warn!(
                failures = inner.failures,
                reset_timeout_secs = self.config.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
        })
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let b = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), BreakerState::Closed);
        }
        let err = fail(&b).await.unwrap_err();
        assert!(matches!(err, BreakerError::Operation("boom")));
        assert_eq!(b.state(), BreakerState::Open);

        let calls = AtomicUsize::new(0);
        let err = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(matches!(err, BreakerError::Open { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_trial_closes_and_zeroes_counters() {
        let b = breaker(1, Duration::from_millis(20));
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let value = b.execute(|| async { Ok::<_, &str>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let stats = b.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.failures, 0);
        assert!(stats.last_success.is_some());
        assert!(stats.last_failure.is_some());
    }

    #[tokio::test]
    async fn failed_trial_reopens() {
        let b = breaker(1, Duration::from_millis(20));
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(fail(&b).await, Err(BreakerError::Operation(_))));
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(fail(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn success_interrupts_failure_streak() {
        let b = breaker(2, Duration::from_secs(60));
        let _ = fail(&b).await;
        b.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().failures, 1);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let b = breaker(1, Duration::from_secs(60));
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        b.reset();
        let stats = b.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failures, 0);
        assert!(b.execute(|| async { Ok::<_, &str>(()) }).await.is_ok());
    }

    #[test]
    fn fresh_stats_have_no_timestamps() {
        let stats = CircuitBreaker::default().stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert!(stats.last_success.is_none());
        assert!(stats.last_failure.is_none());
    }
}
