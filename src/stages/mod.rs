// Pipeline stages: one message consumer per unit of pipeline work. Each
// stage calls exactly one collaborator behind a circuit breaker, advances the
// document on success and converts every failure into FAILED feedback. A
// stage never lets an error escape its handler: a crash would stall every
// document sharing the consumer group.

pub mod classification;
pub mod extraction;
pub mod transaction;

pub use classification::ClassificationStage;
pub use extraction::ExtractionStage;
pub use transaction::TransactionStage;

use lapin::Channel;
use tracing::error;

use crate::data_model::FeedbackMessage;
use crate::error::PipelineError;
use crate::messaging::queues::publish_json;
use crate::utils::prometheus_metrics::FEEDBACK_PUBLISH_ERRORS_TOTAL;

/// Publishes a feedback message, best-effort. Feedback loss is survivable
/// (the TTL on processing state eventually cleans up), so a publish error is
/// logged and counted rather than propagated.
pub(crate) async fn emit_feedback(channel: &Channel, queue: &str, feedback: &FeedbackMessage) {
    if let Err(e) = publish_json(channel, queue, feedback).await {
        FEEDBACK_PUBLISH_ERRORS_TOTAL.inc();
        error!(
            document_id = %feedback.document_id,
            stage = feedback.stage.as_str(),
            error = %e,
            "Failed to publish feedback message"
        );
    }
}

/// Failure detail string for FAILED feedback. An open breaker gets a
/// distinguishable prefix so the outage is visible in the document's error
/// message without waiting out any network timeout.
pub(crate) fn failure_details(error: &PipelineError) -> String {
    match error {
        PipelineError::CircuitOpen(name) => {
            format!("fallback triggered: circuit breaker '{}' is open", name)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_breaker_gets_the_fallback_prefix() {
        let details = failure_details(&PipelineError::CircuitOpen("classifier".into()));
        assert_eq!(
            details,
            "fallback triggered: circuit breaker 'classifier' is open"
        );
    }

    #[test]
    fn other_errors_pass_through_their_display() {
        let details = failure_details(&PipelineError::ExtractionError("no text".into()));
        assert_eq!(details, "Text extraction error: no text");
    }
}
