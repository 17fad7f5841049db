//! Circuit breaker around remote operations.
//!
//! After `max_failures` consecutive failures, further calls are rejected with
//! [`Error::BreakerOpen`] until `reset_window` has elapsed since the last
//! failure. Once the window passes, the failure count resets and the next
//! call goes through as a trial; its outcome decides whether the breaker
//! stays closed or trips again.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_window: Duration::from_secs(300),
        }
    }
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Runs `op` under the breaker. The lock is never held across the
    /// operation itself, so slow remote calls do not serialize each other.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit_at(Instant::now()).await?;
        match op.await {
            Ok(v) => {
                self.record_success().await;
                Ok(v)
            }
            Err(err) => {
                self.record_failure_at(Instant::now()).await;
                Err(err)
            }
        }
    }

    async fn admit_at(&self, now: Instant) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failures < self.cfg.max_failures {
            return Ok(());
        }
        match state.last_failure {
            Some(at) if now.saturating_duration_since(at) < self.cfg.reset_window => {
                Err(Error::BreakerOpen)
            }
            _ => {
                // Window elapsed: allow a trial call.
                state.failures = 0;
                Ok(())
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.failures = 0;
        state.last_failure = None;
    }

    async fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock().await;
        state.failures += 1;
        state.last_failure = Some(now);
        if state.failures == self.cfg.max_failures {
            warn!(
                failures = state.failures,
                "circuit breaker opened after consecutive failures"
            );
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_window: Duration::from_secs(300),
        }
    }

    async fn fail(b: &CircuitBreaker, at: Instant) {
        b.admit_at(at).await.unwrap();
        b.record_failure_at(at).await;
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects() {
        let b = CircuitBreaker::new(cfg());
        let now = Instant::now();
        for _ in 0..3 {
            fail(&b, now).await;
        }
        assert!(matches!(b.admit_at(now).await, Err(Error::BreakerOpen)));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = CircuitBreaker::new(cfg());
        let now = Instant::now();
        fail(&b, now).await;
        fail(&b, now).await;
        b.record_success().await;
        fail(&b, now).await;
        // Two failures shy of the threshold again.
        assert!(b.admit_at(now).await.is_ok());
    }

    #[tokio::test]
    async fn trial_allowed_after_reset_window() {
        let b = CircuitBreaker::new(cfg());
        let now = Instant::now();
        for _ in 0..3 {
            fail(&b, now).await;
        }
        let later = now + Duration::from_secs(301);
        // Trial call admitted; a single failure does not re-open the breaker.
        assert!(b.admit_at(later).await.is_ok());
        b.record_failure_at(later).await;
        assert!(b.admit_at(later).await.is_ok());
    }

    #[tokio::test]
    async fn run_propagates_operation_result() {
        let b = CircuitBreaker::new(cfg());
        let ok: Result<u32> = b.run(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        let err: Result<u32> = b.run(async { Err(Error::Transient("boom".into())) }).await;
        assert!(matches!(err, Err(Error::Transient(_))));
    }
}
