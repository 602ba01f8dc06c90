// src/stages/transaction.rs

use async_trait::async_trait;
use lapin::Channel;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::clients::{CircuitBreaker, TransactionGateway};
use crate::data_model::{FeedbackMessage, FeedbackStatus, PipelineStage, TransactionTask};
use crate::messaging::queues::MessageHandler;
use crate::stages::{emit_feedback, failure_details};
use crate::utils::prometheus_metrics::{
    ACTIVE_PROCESSING_TASKS, STAGE_TASKS_FAILED_TOTAL, STAGE_TASKS_PROCESSED_TOTAL,
    TASK_DESERIALIZATION_ERRORS_TOTAL, TASK_PROCESSING_DURATION_SECONDS,
};

/// Final pipeline stage: one consumed message per classified item, one
/// created transaction, one SUCCESS/FAILED feedback.
pub struct TransactionStage {
    gateway: Arc<dyn TransactionGateway>,
    gateway_breaker: CircuitBreaker,
    publish_channel: Channel,
    feedback_queue: String,
}

impl TransactionStage {
    pub fn new(
        gateway: Arc<dyn TransactionGateway>,
        gateway_breaker: CircuitBreaker,
        publish_channel: Channel,
        feedback_queue: String,
    ) -> Self {
        TransactionStage {
            gateway,
            gateway_breaker,
            publish_channel,
            feedback_queue,
        }
    }

    async fn process(&self, task: TransactionTask) {
        let result = self
            .gateway_breaker
            .call(|| self.gateway.create_transaction(&task))
            .await;

        let feedback = match result {
            Ok(()) => {
                debug!(
                    document_id = %task.document_id,
                    item_index = task.item_index,
                    "Transaction created"
                );
                STAGE_TASKS_PROCESSED_TOTAL.inc();
                FeedbackMessage::new(
                    task.document_id,
                    task.user_id,
                    PipelineStage::Transaction,
                    FeedbackStatus::Success,
                    None,
                )
            }
            Err(e) => {
                warn!(
                    document_id = %task.document_id,
                    item_index = task.item_index,
                    error = %e,
                    "Transaction creation failed"
                );
                STAGE_TASKS_FAILED_TOTAL.inc();
                FeedbackMessage::failed(
                    task.document_id,
                    task.user_id,
                    PipelineStage::Transaction,
                    format!(
                        "item {} ('{}'): {}",
                        task.item_index,
                        task.item.name,
                        failure_details(&e)
                    ),
                )
            }
        };

        emit_feedback(&self.publish_channel, &self.feedback_queue, &feedback).await;
    }
}

#[async_trait]
impl MessageHandler for TransactionStage {
    fn name(&self) -> &'static str {
        "transaction"
    }

    async fn handle(&self, payload: &[u8]) {
        ACTIVE_PROCESSING_TASKS.inc();
        let processing_timer = TASK_PROCESSING_DURATION_SECONDS.start_timer();

        match serde_json::from_slice::<TransactionTask>(payload) {
            Ok(task) => {
                let span = info_span!(
                    "transaction_task",
                    document_id = %task.document_id,
                    item_index = task.item_index
                );
                self.process(task).instrument(span).await;
            }
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Failed to deserialize transaction task"
                );
            }
        }

        processing_timer.observe_duration();
        ACTIVE_PROCESSING_TASKS.dec();
    }
}
