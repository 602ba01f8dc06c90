// src/documents/state_manager.rs

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::data_model::{Document, DocumentStatus};
use crate::documents::repository::DocumentRepository;
use crate::error::{PipelineError, Result};
use crate::processing::broadcast::StatusBroadcaster;
use crate::utils::prometheus_metrics::{DOCUMENTS_FAILED_TOTAL, DOCUMENTS_PROCESSED_TOTAL};

/// Sole authority over `Document.status`: every transition is persisted and
/// then broadcast. Transitions are validated against the state graph; an
/// invalid one (anything out of a terminal state, or a backward move) is
/// logged and skipped, which makes replayed or late feedback harmless.
pub struct DocumentStateManager {
    repository: Arc<dyn DocumentRepository>,
    broadcaster: Arc<dyn StatusBroadcaster>,
}

impl DocumentStateManager {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        broadcaster: Arc<dyn StatusBroadcaster>,
    ) -> Self {
        DocumentStateManager {
            repository,
            broadcaster,
        }
    }

    /// Persists a freshly uploaded document and pushes its first snapshot.
    pub async fn create(&self, document: Document) -> Result<Document> {
        self.repository.create(&document).await?;
        self.broadcaster.publish(&document.to_status_update()).await;
        Ok(document)
    }

    pub async fn find(&self, document_id: Uuid) -> Result<Option<Document>> {
        self.repository.find_by_id(document_id).await
    }

    pub async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Document>> {
        self.repository.find_by_user(user_id).await
    }

    /// Moves a document to `status`. Unknown ids fail with DocumentNotFound;
    /// a transition the state graph forbids returns the unchanged row.
    pub async fn update_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Document> {
        let current = self
            .repository
            .find_by_id(document_id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(document_id))?;

        if !current.status.can_transition_to(status) {
            warn!(
                document_id = %document_id,
                from = current.status.as_str(),
                to = status.as_str(),
                "Skipping invalid status transition"
            );
            return Ok(current);
        }

        let updated = self
            .repository
            .update_status(document_id, status, error_message)
            .await?
            .ok_or(PipelineError::DocumentNotFound(document_id))?;

        match updated.status {
            DocumentStatus::Processed => DOCUMENTS_PROCESSED_TOTAL.inc(),
            DocumentStatus::Failed => DOCUMENTS_FAILED_TOTAL.inc(),
            _ => {}
        }

        info!(
            document_id = %document_id,
            status = updated.status.as_str(),
            "Document status updated"
        );

        // Best-effort push; the broadcaster logs its own failures.
        self.broadcaster.publish(&updated.to_status_update()).await;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::repository::InMemoryDocumentRepository;
    use crate::processing::broadcast::ChannelBroadcaster;

    fn manager() -> (DocumentStateManager, Arc<ChannelBroadcaster>) {
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let manager = DocumentStateManager::new(
            Arc::new(InMemoryDocumentRepository::new()),
            broadcaster.clone(),
        );
        (manager, broadcaster)
    }

    #[tokio::test]
    async fn update_unknown_document_is_not_found() {
        let (manager, _) = manager();
        let result = manager
            .update_status(Uuid::new_v4(), DocumentStatus::Processing, None)
            .await;
        assert!(matches!(result, Err(PipelineError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn forward_transition_persists_and_broadcasts() {
        let (manager, broadcaster) = manager();
        let doc = manager
            .create(Document::new(Uuid::new_v4(), "blob-1".into()))
            .await
            .unwrap();

        let mut rx = broadcaster.subscribe(doc.user_id).await;

        let updated = manager
            .update_status(doc.id, DocumentStatus::Processing, None)
            .await
            .unwrap();
        assert_eq!(updated.status, DocumentStatus::Processing);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.document_id, doc.id);
        assert_eq!(snapshot.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_document_ignores_further_transitions() {
        let (manager, _) = manager();
        let doc = manager
            .create(Document::new(Uuid::new_v4(), "blob-1".into()))
            .await
            .unwrap();

        manager
            .update_status(doc.id, DocumentStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        // A late success must not reopen the document.
        let after = manager
            .update_status(doc.id, DocumentStatus::Processed, None)
            .await
            .unwrap();
        assert_eq!(after.status, DocumentStatus::Failed);
        assert_eq!(after.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn backward_transition_is_skipped() {
        let (manager, _) = manager();
        let doc = manager
            .create(Document::new(Uuid::new_v4(), "blob-1".into()))
            .await
            .unwrap();

        manager
            .update_status(doc.id, DocumentStatus::Classifying, None)
            .await
            .unwrap();
        let after = manager
            .update_status(doc.id, DocumentStatus::ExtractingText, None)
            .await
            .unwrap();
        assert_eq!(after.status, DocumentStatus::Classifying);
    }
}
