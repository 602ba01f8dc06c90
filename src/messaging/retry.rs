// src/messaging/retry.rs
//
// Explicit retry policy wrapping a stage's unit of work, with the dead-letter
// hand-off as the terminal branch. Transient errors are retried with
// exponential backoff; permanent errors return immediately so the stage can
// emit FAILED feedback without burning retry cycles.

use lapin::Channel;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RetrySettings;
use crate::data_model::DeadLetterMessage;
use crate::error::PipelineError;
use crate::messaging::queues::publish_json;
use crate::utils::prometheus_metrics::{RETRY_ATTEMPTS_TOTAL, RETRY_EXHAUSTED_TOTAL};

/// Terminal outcomes of a retried operation.
#[derive(Debug)]
pub enum RetryError {
    /// The error predicate marked this non-retryable; no attempts were wasted.
    Permanent(PipelineError),
    /// Every attempt failed; the message belongs on the dead-letter channel.
    Exhausted {
        attempts: u32,
        last_error: PipelineError,
    },
}

impl RetryError {
    pub fn reason(&self) -> String {
        match self {
            RetryError::Permanent(e) => e.to_string(),
            RetryError::Exhausted {
                attempts,
                last_error,
            } => format!("retries exhausted after {} attempts: {}", attempts, last_error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            multiplier,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        RetryPolicy::new(
            settings.max_attempts,
            settings.initial_backoff(),
            settings.multiplier,
        )
    }

    /// Runs `op` up to `max_attempts` times. The backoff schedule for the
    /// defaults (3 attempts, 1s, x2) is 1s then 2s, with a little jitter so
    /// competing consumers don't retry in lockstep.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    return Err(RetryError::Permanent(e));
                }
                Err(e) => {
                    RETRY_ATTEMPTS_TOTAL.inc();
                    if attempt >= self.max_attempts {
                        RETRY_EXHAUSTED_TOTAL.inc();
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Attempt failed. Backing off before retry."
                    );
                    sleep(with_jitter(backoff)).await;
                    backoff = backoff.mul_f64(self.multiplier);
                    attempt += 1;
                }
            }
        }
    }
}

// Up to 10% extra, never less than the configured backoff.
fn with_jitter(backoff: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    backoff.mul_f64(1.0 + jitter)
}

/// Hands an exhausted message to the dead-letter channel. The dead-letter
/// consumer terminally fails the document, so even a message that can never
/// succeed reaches a terminal state.
pub async fn publish_dead_letter(
    channel: &Channel,
    dead_letter_queue: &str,
    message: &DeadLetterMessage,
) -> Result<(), PipelineError> {
    publish_json(channel, dead_letter_queue, message).await?;
    info!(
        document_id = %message.document_id,
        stage = message.stage.as_str(),
        reason = %message.reason,
        "Message routed to dead-letter queue"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), 2.0)
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast_policy(3)
            .run(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PipelineError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast_policy(3)
            .run(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::QueueError("broker hiccup".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = fast_policy(3)
            .run(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::BlobError("still down".into()))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, PipelineError::BlobError(_)));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_skip_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = fast_policy(3)
            .run(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::ExtractionError("unreadable image".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_breaker_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = fast_policy(3)
            .run(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::CircuitOpen("extractor".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
