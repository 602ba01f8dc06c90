// tests/feedback_flow_test.rs
//
// End-to-end feedback handling against in-memory backends: the dispatcher,
// the progress counters and the document state manager wired together the
// same way the feedback worker wires them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;
use ReceiptFlow::config::StateStoreSettings;
use ReceiptFlow::data_model::{
    DeadLetterMessage, Document, DocumentStatus, FeedbackMessage, FeedbackStatus, PipelineStage,
};
use ReceiptFlow::documents::{DocumentStateManager, InMemoryDocumentRepository};
use ReceiptFlow::error::{PipelineError, Result};
use ReceiptFlow::messaging::MessageHandler;
use ReceiptFlow::processing::feedback::{DeadLetterConsumer, FeedbackConsumer};
use ReceiptFlow::processing::{
    ChannelBroadcaster, FeedbackDispatcher, InMemoryStateStore, ProcessingProgress,
    ProcessingStateStore, ResilientStateStore,
};

struct Harness {
    manager: Arc<DocumentStateManager>,
    store: Arc<InMemoryStateStore>,
    broadcaster: Arc<ChannelBroadcaster>,
    dispatcher: Arc<FeedbackDispatcher>,
}

impl Harness {
    fn new() -> Self {
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let manager = Arc::new(DocumentStateManager::new(
            Arc::new(InMemoryDocumentRepository::new()),
            broadcaster.clone(),
        ));
        let store = Arc::new(InMemoryStateStore::new(Duration::from_secs(60)));
        let dispatcher = Arc::new(FeedbackDispatcher::standard(
            manager.clone(),
            store.clone() as Arc<dyn ProcessingStateStore>,
        ));
        Harness {
            manager,
            store,
            broadcaster,
            dispatcher,
        }
    }

    /// A document that the gateway has already accepted and enqueued.
    async fn accepted_document(&self) -> Document {
        let doc = self
            .manager
            .create(Document::new(Uuid::new_v4(), "blob-1.pdf".into()))
            .await
            .unwrap();
        self.manager
            .update_status(doc.id, DocumentStatus::Processing, None)
            .await
            .unwrap()
    }

    async fn status_of(&self, id: Uuid) -> DocumentStatus {
        self.manager.find(id).await.unwrap().unwrap().status
    }

    async fn dispatch(&self, feedback: FeedbackMessage) {
        self.dispatcher.dispatch(&feedback).await;
    }
}

fn feedback(
    doc: &Document,
    stage: PipelineStage,
    status: FeedbackStatus,
) -> FeedbackMessage {
    FeedbackMessage::new(doc.id, doc.user_id, stage, status, None)
}

#[tokio::test]
async fn document_completes_when_every_item_succeeds() {
    let h = Harness::new();
    let doc = h.accepted_document().await;

    h.dispatch(feedback(&doc, PipelineStage::Extraction, FeedbackStatus::Started))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::ExtractingText);

    h.dispatch(FeedbackMessage::items_count(doc.id, doc.user_id, 2))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Classifying);

    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Classifying);

    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Processed);

    // Completion consumed the counters.
    assert!(h.store.increment_processed(doc.id).await.unwrap().is_none());
}

#[tokio::test]
async fn one_failed_item_fails_the_whole_document() {
    let h = Harness::new();
    let doc = h.accepted_document().await;

    h.dispatch(FeedbackMessage::items_count(doc.id, doc.user_id, 2))
        .await;
    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    h.dispatch(FeedbackMessage::failed(
        doc.id,
        doc.user_id,
        PipelineStage::Transaction,
        "item 1 ('Coffee'): transaction service returned 502",
    ))
    .await;

    let failed = h.manager.find(doc.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("transaction service returned 502"));

    // A success straggling in after the failure must not resurrect the
    // document or its counters.
    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Failed);
    assert!(h.store.increment_processed(doc.id).await.unwrap().is_none());
}

#[tokio::test]
async fn replayed_success_after_completion_is_harmless() {
    let h = Harness::new();
    let doc = h.accepted_document().await;

    h.dispatch(FeedbackMessage::items_count(doc.id, doc.user_id, 1))
        .await;
    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Processed);

    // At-least-once delivery: the same feedback arrives again.
    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;
    assert_eq!(h.status_of(doc.id).await, DocumentStatus::Processed);
}

#[tokio::test]
async fn extraction_failure_fails_the_document() {
    let h = Harness::new();
    let doc = h.accepted_document().await;

    h.dispatch(FeedbackMessage::failed(
        doc.id,
        doc.user_id,
        PipelineStage::Extraction,
        "fallback triggered: circuit breaker 'text_extractor' is open",
    ))
    .await;

    let failed = h.manager.find(doc.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("fallback triggered"));
}

#[tokio::test]
async fn terminal_snapshot_reaches_a_live_subscriber() {
    let h = Harness::new();
    let doc = h.accepted_document().await;
    let mut rx = h.broadcaster.subscribe(doc.user_id).await;

    h.dispatch(FeedbackMessage::items_count(doc.id, doc.user_id, 1))
        .await;
    h.dispatch(feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;

    let mut last = None;
    while let Ok(update) = rx.try_recv() {
        last = Some(update);
    }
    let last = last.expect("at least one snapshot");
    assert_eq!(last.document_id, doc.id);
    assert_eq!(last.status, DocumentStatus::Processed);
}

#[tokio::test]
async fn feedback_rides_the_wire_through_the_consumer() {
    let h = Harness::new();
    let doc = h.accepted_document().await;
    let consumer = FeedbackConsumer {
        dispatcher: h.dispatcher.clone(),
    };

    let payload = serde_json::to_vec(&feedback(
        &doc,
        PipelineStage::Extraction,
        FeedbackStatus::Started,
    ))
    .unwrap();
    consumer.handle(&payload).await;

    assert_eq!(h.status_of(doc.id).await, DocumentStatus::ExtractingText);
}

#[tokio::test]
async fn malformed_feedback_payload_is_dropped() {
    let h = Harness::new();
    let consumer = FeedbackConsumer {
        dispatcher: h.dispatcher.clone(),
    };

    // Must not panic or kill the consumer.
    consumer.handle(b"{ not json").await;
}

#[tokio::test]
async fn feedback_for_unknown_document_is_dropped() {
    let h = Harness::new();

    h.dispatch(FeedbackMessage::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        PipelineStage::Extraction,
        FeedbackStatus::Started,
        None,
    ))
    .await;
}

/// Remote store that serves the counters fine but errors on the completion
/// check, as a store dropping out between two calls would.
struct CompletionCheckFailsStore {
    inner: InMemoryStateStore,
}

#[async_trait]
impl ProcessingStateStore for CompletionCheckFailsStore {
    async fn initialize(&self, document_id: Uuid, total_items: u32) -> Result<()> {
        self.inner.initialize(document_id, total_items).await
    }

    async fn increment_processed(&self, document_id: Uuid) -> Result<Option<ProcessingProgress>> {
        self.inner.increment_processed(document_id).await
    }

    async fn is_complete(&self, _: Uuid) -> Result<bool> {
        Err(PipelineError::StateStoreError("read timed out".into()))
    }

    async fn clear(&self, document_id: Uuid) -> Result<()> {
        self.inner.clear(document_id).await
    }
}

#[tokio::test]
async fn completion_does_not_depend_on_a_second_store_read() {
    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let manager = Arc::new(DocumentStateManager::new(
        Arc::new(InMemoryDocumentRepository::new()),
        broadcaster,
    ));
    // The degraded completion check lands in an empty fallback and reports
    // false; the document must still reach PROCESSED off the increment.
    let store = Arc::new(ResilientStateStore::new(
        Arc::new(CompletionCheckFailsStore {
            inner: InMemoryStateStore::new(Duration::from_secs(60)),
        }),
        Arc::new(InMemoryStateStore::new(Duration::from_secs(60))),
        &StateStoreSettings {
            ttl_secs: 60,
            remote_attempts: 1,
            remote_backoff_ms: 1,
        },
    ));
    let dispatcher = FeedbackDispatcher::standard(
        manager.clone(),
        store as Arc<dyn ProcessingStateStore>,
    );

    let doc = manager
        .create(Document::new(Uuid::new_v4(), "blob-1.pdf".into()))
        .await
        .unwrap();
    manager
        .update_status(doc.id, DocumentStatus::Processing, None)
        .await
        .unwrap();

    dispatcher
        .dispatch(&FeedbackMessage::items_count(doc.id, doc.user_id, 1))
        .await;
    dispatcher
        .dispatch(&feedback(&doc, PipelineStage::Transaction, FeedbackStatus::Success))
        .await;

    let status = manager.find(doc.id).await.unwrap().unwrap().status;
    assert_eq!(status, DocumentStatus::Processed);
}

#[tokio::test]
async fn dead_letter_terminally_fails_the_document() {
    let h = Harness::new();
    let doc = h.accepted_document().await;
    h.store.initialize(doc.id, 3).await.unwrap();

    let consumer = DeadLetterConsumer {
        state_manager: h.manager.clone(),
        state_store: h.store.clone() as Arc<dyn ProcessingStateStore>,
    };
    let message = DeadLetterMessage {
        document_id: doc.id,
        user_id: doc.user_id,
        stage: PipelineStage::Extraction,
        reason: "failed after 3 attempts: text extraction service unreachable".into(),
        payload: serde_json::json!({ "blob_key": "blob-1.pdf" }),
        timestamp: Utc::now(),
    };
    consumer
        .handle(&serde_json::to_vec(&message).unwrap())
        .await;

    let failed = h.manager.find(doc.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("retries were exhausted"));

    // Counters are gone too.
    assert!(h.store.increment_processed(doc.id).await.unwrap().is_none());
}
