// src/stages/extraction.rs

use async_trait::async_trait;
use chrono::Utc;
use lapin::Channel;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::clients::{BlobStore, CircuitBreaker, TextExtractor};
use crate::data_model::{
    ClassificationTask, DeadLetterMessage, ExtractionTask, FeedbackMessage, FeedbackStatus,
    PipelineStage,
};
use crate::messaging::queues::{publish_json, MessageHandler};
use crate::messaging::retry::{publish_dead_letter, RetryError, RetryPolicy};
use crate::stages::{emit_feedback, failure_details};
use crate::utils::prometheus_metrics::{
    ACTIVE_PROCESSING_TASKS, STAGE_TASKS_FAILED_TOTAL, STAGE_TASKS_PROCESSED_TOTAL,
    TASK_DESERIALIZATION_ERRORS_TOTAL, TASK_PROCESSING_DURATION_SECONDS,
};

/// First pipeline stage: blob fetch + text extraction. Wrapped by the retry
/// layer; transient failures back off and eventually dead-letter, permanent
/// content failures short-circuit to FAILED feedback.
pub struct ExtractionStage {
    blob_store: Arc<dyn BlobStore>,
    extractor: Arc<dyn TextExtractor>,
    blob_breaker: CircuitBreaker,
    extractor_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    publish_channel: Channel,
    next_queue: String,
    feedback_queue: String,
    dead_letter_queue: String,
}

impl ExtractionStage {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        extractor: Arc<dyn TextExtractor>,
        blob_breaker: CircuitBreaker,
        extractor_breaker: CircuitBreaker,
        retry_policy: RetryPolicy,
        publish_channel: Channel,
        next_queue: String,
        feedback_queue: String,
        dead_letter_queue: String,
    ) -> Self {
        ExtractionStage {
            blob_store,
            extractor,
            blob_breaker,
            extractor_breaker,
            retry_policy,
            publish_channel,
            next_queue,
            feedback_queue,
            dead_letter_queue,
        }
    }

    /// One unit of work: download the blob, extract its text. Both calls go
    /// through their breaker so a dead upstream fails fast.
    async fn extract_text(&self, task: &ExtractionTask) -> crate::error::Result<String> {
        let bytes = self
            .blob_breaker
            .call(|| self.blob_store.get(&task.blob_key))
            .await?;
        self.extractor_breaker
            .call(|| self.extractor.extract(&task.blob_key, &bytes))
            .await
    }

    async fn process(&self, task: ExtractionTask) {
        emit_feedback(
            &self.publish_channel,
            &self.feedback_queue,
            &FeedbackMessage::new(
                task.document_id,
                task.user_id,
                PipelineStage::Extraction,
                FeedbackStatus::Started,
                None,
            ),
        )
        .await;

        let result = self.retry_policy.run(|| self.extract_text(&task)).await;

        match result {
            Ok(text) => {
                let next = ClassificationTask {
                    document_id: task.document_id,
                    user_id: task.user_id,
                    text,
                    business_date: task.business_date,
                };
                if let Err(e) = publish_json(&self.publish_channel, &self.next_queue, &next).await {
                    error!(document_id = %task.document_id, error = %e, "Failed to enqueue classification task");
                    STAGE_TASKS_FAILED_TOTAL.inc();
                    emit_feedback(
                        &self.publish_channel,
                        &self.feedback_queue,
                        &FeedbackMessage::failed(
                            task.document_id,
                            task.user_id,
                            PipelineStage::Extraction,
                            format!("failed to enqueue classification task: {}", e),
                        ),
                    )
                    .await;
                    return;
                }

                debug!(document_id = %task.document_id, "Extraction complete; classification enqueued");
                STAGE_TASKS_PROCESSED_TOTAL.inc();
                emit_feedback(
                    &self.publish_channel,
                    &self.feedback_queue,
                    &FeedbackMessage::new(
                        task.document_id,
                        task.user_id,
                        PipelineStage::Extraction,
                        FeedbackStatus::Success,
                        None,
                    ),
                )
                .await;
            }
            Err(RetryError::Permanent(e)) => {
                warn!(document_id = %task.document_id, error = %e, "Extraction failed permanently");
                STAGE_TASKS_FAILED_TOTAL.inc();
                emit_feedback(
                    &self.publish_channel,
                    &self.feedback_queue,
                    &FeedbackMessage::failed(
                        task.document_id,
                        task.user_id,
                        PipelineStage::Extraction,
                        failure_details(&e),
                    ),
                )
                .await;
            }
            Err(exhausted @ RetryError::Exhausted { .. }) => {
                STAGE_TASKS_FAILED_TOTAL.inc();
                let dead_letter = DeadLetterMessage {
                    document_id: task.document_id,
                    user_id: task.user_id,
                    stage: PipelineStage::Extraction,
                    reason: exhausted.reason(),
                    payload: serde_json::to_value(&task).unwrap_or_default(),
                    timestamp: Utc::now(),
                };
                if let Err(e) = publish_dead_letter(
                    &self.publish_channel,
                    &self.dead_letter_queue,
                    &dead_letter,
                )
                .await
                {
                    // Last resort: fail the document through feedback so it
                    // still terminates.
                    error!(document_id = %task.document_id, error = %e, "Failed to publish dead letter");
                    emit_feedback(
                        &self.publish_channel,
                        &self.feedback_queue,
                        &FeedbackMessage::failed(
                            task.document_id,
                            task.user_id,
                            PipelineStage::Extraction,
                            dead_letter.reason,
                        ),
                    )
                    .await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ExtractionStage {
    fn name(&self) -> &'static str {
        "extraction"
    }

    async fn handle(&self, payload: &[u8]) {
        ACTIVE_PROCESSING_TASKS.inc();
        let processing_timer = TASK_PROCESSING_DURATION_SECONDS.start_timer();

        match serde_json::from_slice::<ExtractionTask>(payload) {
            Ok(task) => {
                let span = info_span!("extraction_task", document_id = %task.document_id);
                self.process(task).instrument(span).await;
            }
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Failed to deserialize extraction task"
                );
            }
        }

        processing_timer.observe_duration();
        ACTIVE_PROCESSING_TASKS.dec();
    }
}
