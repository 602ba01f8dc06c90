// src/processing/feedback.rs
//
// Routes each inbound feedback message to the handler registered for its
// stage. The registry is built once at startup from an explicit handler
// list; a stage with no handler is logged and dropped, never fatal.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::data_model::{
    DeadLetterMessage, DocumentStatus, FeedbackMessage, FeedbackStatus, PipelineStage,
};
use crate::documents::state_manager::DocumentStateManager;
use crate::error::{PipelineError, Result};
use crate::messaging::queues::MessageHandler;
use crate::processing::state_store::ProcessingStateStore;
use crate::utils::prometheus_metrics::{
    DEAD_LETTERS_CONSUMED_TOTAL, FEEDBACK_DROPPED_TOTAL, FEEDBACK_MESSAGES_TOTAL,
    TASK_DESERIALIZATION_ERRORS_TOTAL,
};

/// One per-stage interpreter of feedback events.
#[async_trait]
pub trait FeedbackHandler: Send + Sync {
    fn stage(&self) -> PipelineStage;

    async fn handle(&self, feedback: &FeedbackMessage) -> Result<()>;
}

pub struct FeedbackDispatcher {
    handlers: HashMap<PipelineStage, Box<dyn FeedbackHandler>>,
}

impl FeedbackDispatcher {
    pub fn new(handlers: Vec<Box<dyn FeedbackHandler>>) -> Self {
        let mut map: HashMap<PipelineStage, Box<dyn FeedbackHandler>> = HashMap::new();
        for handler in handlers {
            let stage = handler.stage();
            if map.insert(stage, handler).is_some() {
                warn!(stage = stage.as_str(), "Duplicate feedback handler; keeping the last one");
            }
        }
        FeedbackDispatcher { handlers: map }
    }

    /// The standard registry: one handler per pipeline stage.
    pub fn standard(
        state_manager: Arc<DocumentStateManager>,
        state_store: Arc<dyn ProcessingStateStore>,
    ) -> Self {
        FeedbackDispatcher::new(vec![
            Box::new(ExtractionFeedbackHandler {
                state_manager: state_manager.clone(),
            }),
            Box::new(ClassificationFeedbackHandler {
                state_manager: state_manager.clone(),
                state_store: state_store.clone(),
            }),
            Box::new(TransactionFeedbackHandler {
                state_manager,
                state_store,
            }),
        ])
    }

    pub async fn dispatch(&self, feedback: &FeedbackMessage) {
        FEEDBACK_MESSAGES_TOTAL.inc();

        let Some(handler) = self.handlers.get(&feedback.stage) else {
            FEEDBACK_DROPPED_TOTAL.inc();
            warn!(
                stage = feedback.stage.as_str(),
                document_id = %feedback.document_id,
                "No handler registered for stage; dropping feedback"
            );
            return;
        };

        match handler.handle(feedback).await {
            Ok(()) => {}
            Err(PipelineError::DocumentNotFound(id)) => {
                // A feedback for a deleted/unknown document is not fatal.
                FEEDBACK_DROPPED_TOTAL.inc();
                warn!(document_id = %id, stage = feedback.stage.as_str(), "Feedback for unknown document; dropping");
            }
            Err(e) => {
                error!(
                    document_id = %feedback.document_id,
                    stage = feedback.stage.as_str(),
                    error = %e,
                    "Feedback handler failed"
                );
            }
        }
    }
}

// --- Stage handlers ---

/// Extraction feedback is a pass-through into the document status.
pub struct ExtractionFeedbackHandler {
    pub state_manager: Arc<DocumentStateManager>,
}

#[async_trait]
impl FeedbackHandler for ExtractionFeedbackHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Extraction
    }

    async fn handle(&self, feedback: &FeedbackMessage) -> Result<()> {
        match feedback.status {
            FeedbackStatus::Started => {
                self.state_manager
                    .update_status(feedback.document_id, DocumentStatus::ExtractingText, None)
                    .await?;
            }
            FeedbackStatus::Success => {
                // The classification stage drives the next transition.
                debug!(document_id = %feedback.document_id, "Extraction succeeded");
            }
            FeedbackStatus::Failed => {
                self.state_manager
                    .update_status(
                        feedback.document_id,
                        DocumentStatus::Failed,
                        feedback.details.clone(),
                    )
                    .await?;
            }
            FeedbackStatus::ItemsCount => {
                warn!(document_id = %feedback.document_id, "Unexpected ITEMS_COUNT from extraction stage");
            }
        }
        Ok(())
    }
}

/// Classification feedback initializes the processing counters.
pub struct ClassificationFeedbackHandler {
    pub state_manager: Arc<DocumentStateManager>,
    pub state_store: Arc<dyn ProcessingStateStore>,
}

#[async_trait]
impl FeedbackHandler for ClassificationFeedbackHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Classification
    }

    async fn handle(&self, feedback: &FeedbackMessage) -> Result<()> {
        match feedback.status {
            FeedbackStatus::ItemsCount => {
                let total_items = feedback.total_items.ok_or_else(|| {
                    PipelineError::Unexpected("ITEMS_COUNT feedback without a count".to_string())
                })?;
                // Counter first: the first per-item SUCCESS may arrive right
                // behind this message.
                self.state_store
                    .initialize(feedback.document_id, total_items)
                    .await?;
                self.state_manager
                    .update_status(feedback.document_id, DocumentStatus::Classifying, None)
                    .await?;
            }
            FeedbackStatus::Started => {
                self.state_manager
                    .update_status(feedback.document_id, DocumentStatus::Classifying, None)
                    .await?;
            }
            FeedbackStatus::Failed => {
                self.state_manager
                    .update_status(
                        feedback.document_id,
                        DocumentStatus::Failed,
                        feedback.details.clone(),
                    )
                    .await?;
                self.state_store.clear(feedback.document_id).await?;
            }
            FeedbackStatus::Success => {
                debug!(document_id = %feedback.document_id, "Classification succeeded");
            }
        }
        Ok(())
    }
}

/// Transaction feedback counts per-item outcomes toward completion.
pub struct TransactionFeedbackHandler {
    pub state_manager: Arc<DocumentStateManager>,
    pub state_store: Arc<dyn ProcessingStateStore>,
}

#[async_trait]
impl FeedbackHandler for TransactionFeedbackHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Transaction
    }

    async fn handle(&self, feedback: &FeedbackMessage) -> Result<()> {
        match feedback.status {
            FeedbackStatus::Success => {
                match self
                    .state_store
                    .increment_processed(feedback.document_id)
                    .await?
                {
                    Some(progress) => {
                        if progress.processed_items > progress.total_items {
                            // Counted past the total: a duplicate delivery,
                            // not a completion signal.
                            warn!(
                                document_id = %feedback.document_id,
                                processed = progress.processed_items,
                                total = progress.total_items,
                                "Processed count exceeds total; duplicate delivery suspected"
                            );
                        }
                        if progress.is_complete() {
                            // The increment we just made is the completion
                            // signal; a store failure after it must not leave
                            // the document short of PROCESSED.
                            self.state_manager
                                .update_status(
                                    feedback.document_id,
                                    DocumentStatus::Processed,
                                    None,
                                )
                                .await?;
                            // Consume the entry so replays drop at the store.
                            // On failure the TTL reaps it; the terminal-state
                            // guard already drops replayed completions.
                            if let Err(e) =
                                self.state_store.is_complete(feedback.document_id).await
                            {
                                warn!(
                                    document_id = %feedback.document_id,
                                    error = %e,
                                    "Failed to consume processing state after completion"
                                );
                            }
                        }
                    }
                    None => {
                        // Late or duplicate feedback after completion/failure,
                        // or an increment racing ahead of ITEMS_COUNT. Lossy
                        // by design; the store already logged it.
                        FEEDBACK_DROPPED_TOTAL.inc();
                    }
                }
            }
            FeedbackStatus::Failed => {
                self.state_manager
                    .update_status(
                        feedback.document_id,
                        DocumentStatus::Failed,
                        feedback.details.clone(),
                    )
                    .await?;
                self.state_store.clear(feedback.document_id).await?;
            }
            FeedbackStatus::Started | FeedbackStatus::ItemsCount => {
                warn!(
                    document_id = %feedback.document_id,
                    status = ?feedback.status,
                    "Unexpected feedback status from transaction stage"
                );
            }
        }
        Ok(())
    }
}

// --- Queue consumers ---

/// Consumes the feedback queue and hands each message to the dispatcher.
pub struct FeedbackConsumer {
    pub dispatcher: Arc<FeedbackDispatcher>,
}

#[async_trait]
impl MessageHandler for FeedbackConsumer {
    fn name(&self) -> &'static str {
        "feedback"
    }

    async fn handle(&self, payload: &[u8]) {
        let feedback: FeedbackMessage = match serde_json::from_slice(payload) {
            Ok(f) => f,
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(error = %e, payload = %String::from_utf8_lossy(payload), "Failed to deserialize feedback message");
                return;
            }
        };

        let span = info_span!(
            "feedback",
            document_id = %feedback.document_id,
            stage = feedback.stage.as_str()
        );
        self.dispatcher.dispatch(&feedback).instrument(span).await;
    }
}

/// Consumes the dead-letter queue. Whatever the stage, a dead-lettered
/// message terminally fails its document and clears the counters, so no
/// document is ever stuck in a non-terminal state.
pub struct DeadLetterConsumer {
    pub state_manager: Arc<DocumentStateManager>,
    pub state_store: Arc<dyn ProcessingStateStore>,
}

#[async_trait]
impl MessageHandler for DeadLetterConsumer {
    fn name(&self) -> &'static str {
        "dead_letter"
    }

    async fn handle(&self, payload: &[u8]) {
        let message: DeadLetterMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(error = %e, payload = %String::from_utf8_lossy(payload), "Failed to deserialize dead-letter message");
                return;
            }
        };

        DEAD_LETTERS_CONSUMED_TOTAL.inc();
        warn!(
            document_id = %message.document_id,
            stage = message.stage.as_str(),
            reason = %message.reason,
            "Dead-lettered message; failing document"
        );

        let error_message = format!(
            "processing failed after retries were exhausted ({}): {}",
            message.stage.as_str().to_lowercase(),
            message.reason
        );
        if let Err(e) = self
            .state_manager
            .update_status(message.document_id, DocumentStatus::Failed, Some(error_message))
            .await
        {
            match e {
                PipelineError::DocumentNotFound(id) => {
                    warn!(document_id = %id, "Dead letter for unknown document; dropping");
                }
                other => {
                    error!(document_id = %message.document_id, error = %other, "Failed to fail dead-lettered document");
                }
            }
        }

        if let Err(e) = self.state_store.clear(message.document_id).await {
            error!(document_id = %message.document_id, error = %e, "Failed to clear processing state");
        }
    }
}
