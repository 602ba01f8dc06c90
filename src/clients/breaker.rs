// src/clients/breaker.rs
//
// Circuit breaker around a single external collaborator. After
// `failure_threshold` consecutive failures the breaker opens and every call
// fails fast with CircuitOpen until the cooldown elapses; the first call
// after the cooldown is a probe that closes the breaker on success or
// re-opens it on failure. Bounds per-document latency under a sustained
// upstream outage: callers get an immediate, distinguishable error instead
// of waiting out the network timeout.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;
use crate::error::{PipelineError, Result};
use crate::utils::prometheus_metrics::CIRCUIT_BREAKER_OPEN_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        CircuitBreaker::new(name, settings.failure_threshold, settings.cooldown())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `op` through the breaker. When open (and still cooling down)
    /// the call is rejected immediately with `CircuitOpen`.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed < self.cooldown {
                        CIRCUIT_BREAKER_OPEN_TOTAL.inc();
                        return Err(PipelineError::CircuitOpen(self.name.clone()));
                    }
                    info!(breaker = %self.name, "Cooldown elapsed. Probing with one call.");
                    inner.state = BreakerState::HalfOpen;
                }
                BreakerState::Closed | BreakerState::HalfOpen => {}
            }
        }

        match op().await {
            Ok(value) => {
                let mut inner = self.inner.lock().await;
                if inner.state != BreakerState::Closed {
                    info!(breaker = %self.name, "Probe succeeded. Closing breaker.");
                }
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.consecutive_failures += 1;
                let should_open = inner.state == BreakerState::HalfOpen
                    || inner.consecutive_failures >= self.failure_threshold;
                if should_open && inner.state != BreakerState::Open {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Opening circuit breaker."
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(cooldown_ms))
    }

    async fn failing_call(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err(PipelineError::BlobError("down".into())) })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker(2, 10_000);

        assert!(matches!(
            failing_call(&b).await,
            Err(PipelineError::BlobError(_))
        ));
        assert!(matches!(
            failing_call(&b).await,
            Err(PipelineError::BlobError(_))
        ));
        // Third call is rejected without running the operation.
        let result = b
            .call(|| async { Ok::<_, PipelineError>("should not run") })
            .await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker(2, 10_000);

        let _ = failing_call(&b).await;
        let ok = b.call(|| async { Ok::<_, PipelineError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        // One more failure should not trip the breaker after the reset.
        let _ = failing_call(&b).await;
        let ok = b.call(|| async { Ok::<_, PipelineError>(2) }).await;
        assert_eq!(ok.unwrap(), 2);
    }

    #[tokio::test]
    async fn probes_after_cooldown_and_closes_on_success() {
        let b = breaker(1, 20);

        let _ = failing_call(&b).await;
        assert!(matches!(
            b.call(|| async { Ok::<_, PipelineError>(()) }).await,
            Err(PipelineError::CircuitOpen(_))
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Probe runs and closes the breaker.
        assert!(b.call(|| async { Ok::<_, PipelineError>(()) }).await.is_ok());
        assert!(b.call(|| async { Ok::<_, PipelineError>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens_immediately() {
        let b = breaker(1, 20);

        let _ = failing_call(&b).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Probe fails, breaker re-opens.
        assert!(matches!(
            failing_call(&b).await,
            Err(PipelineError::BlobError(_))
        ));
        assert!(matches!(
            b.call(|| async { Ok::<_, PipelineError>(()) }).await,
            Err(PipelineError::CircuitOpen(_))
        ));
    }
}
