// src/stages/classification.rs

use async_trait::async_trait;
use lapin::Channel;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::clients::{CircuitBreaker, Classifier};
use crate::data_model::{
    ClassificationTask, FeedbackMessage, FeedbackStatus, PipelineStage, TransactionTask,
};
use crate::error::PipelineError;
use crate::messaging::queues::{publish_json, MessageHandler};
use crate::stages::{emit_feedback, failure_details};
use crate::utils::prometheus_metrics::{
    ACTIVE_PROCESSING_TASKS, STAGE_TASKS_FAILED_TOTAL, STAGE_TASKS_PROCESSED_TOTAL,
    TASK_DESERIALIZATION_ERRORS_TOTAL, TASK_PROCESSING_DURATION_SECONDS,
};

/// Second pipeline stage: classify the extracted text into line items and
/// fan one transaction task out per item.
pub struct ClassificationStage {
    classifier: Arc<dyn Classifier>,
    classifier_breaker: CircuitBreaker,
    publish_channel: Channel,
    next_queue: String,
    feedback_queue: String,
}

impl ClassificationStage {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        classifier_breaker: CircuitBreaker,
        publish_channel: Channel,
        next_queue: String,
        feedback_queue: String,
    ) -> Self {
        ClassificationStage {
            classifier,
            classifier_breaker,
            publish_channel,
            next_queue,
            feedback_queue,
        }
    }

    async fn process(&self, task: ClassificationTask) {
        emit_feedback(
            &self.publish_channel,
            &self.feedback_queue,
            &FeedbackMessage::new(
                task.document_id,
                task.user_id,
                PipelineStage::Classification,
                FeedbackStatus::Started,
                None,
            ),
        )
        .await;

        let result = self
            .classifier_breaker
            .call(|| self.classifier.classify(&task.text))
            .await
            .and_then(|items| {
                if items.is_empty() {
                    // Nothing classifiable in the text; retrying won't help.
                    Err(PipelineError::ClassificationError(
                        "classification produced no items".to_string(),
                    ))
                } else {
                    Ok(items)
                }
            });

        let items = match result {
            Ok(items) => items,
            Err(e) => {
                warn!(document_id = %task.document_id, error = %e, "Classification failed");
                STAGE_TASKS_FAILED_TOTAL.inc();
                emit_feedback(
                    &self.publish_channel,
                    &self.feedback_queue,
                    &FeedbackMessage::failed(
                        task.document_id,
                        task.user_id,
                        PipelineStage::Classification,
                        failure_details(&e),
                    ),
                )
                .await;
                return;
            }
        };

        // ITEMS_COUNT must be on the wire before the first per-item SUCCESS
        // can be counted, so publish it (and wait for the broker confirm)
        // before any fan-out message.
        let count_feedback =
            FeedbackMessage::items_count(task.document_id, task.user_id, items.len() as u32);
        if let Err(e) =
            publish_json(&self.publish_channel, &self.feedback_queue, &count_feedback).await
        {
            error!(document_id = %task.document_id, error = %e, "Failed to publish items count");
            STAGE_TASKS_FAILED_TOTAL.inc();
            emit_feedback(
                &self.publish_channel,
                &self.feedback_queue,
                &FeedbackMessage::failed(
                    task.document_id,
                    task.user_id,
                    PipelineStage::Classification,
                    format!("failed to publish items count: {}", e),
                ),
            )
            .await;
            return;
        }

        for (index, item) in items.iter().enumerate() {
            let fan_out = TransactionTask {
                document_id: task.document_id,
                user_id: task.user_id,
                item_index: index as u32,
                item: item.clone(),
            };
            if let Err(e) = publish_json(&self.publish_channel, &self.next_queue, &fan_out).await {
                error!(
                    document_id = %task.document_id,
                    item_index = index,
                    error = %e,
                    "Failed to enqueue transaction task"
                );
                STAGE_TASKS_FAILED_TOTAL.inc();
                emit_feedback(
                    &self.publish_channel,
                    &self.feedback_queue,
                    &FeedbackMessage::failed(
                        task.document_id,
                        task.user_id,
                        PipelineStage::Classification,
                        format!("failed to enqueue transaction task {}: {}", index, e),
                    ),
                )
                .await;
                return;
            }
        }

        debug!(
            document_id = %task.document_id,
            items = items.len(),
            "Classification complete; transaction tasks enqueued"
        );
        STAGE_TASKS_PROCESSED_TOTAL.inc();
    }
}

#[async_trait]
impl MessageHandler for ClassificationStage {
    fn name(&self) -> &'static str {
        "classification"
    }

    async fn handle(&self, payload: &[u8]) {
        ACTIVE_PROCESSING_TASKS.inc();
        let processing_timer = TASK_PROCESSING_DURATION_SECONDS.start_timer();

        match serde_json::from_slice::<ClassificationTask>(payload) {
            Ok(task) => {
                let span = info_span!("classification_task", document_id = %task.document_id);
                self.process(task).instrument(span).await;
            }
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Failed to deserialize classification task"
                );
            }
        }

        processing_timer.observe_duration();
        ACTIVE_PROCESSING_TASKS.dec();
    }
}
