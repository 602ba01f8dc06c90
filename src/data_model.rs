use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an uploaded document.
///
/// Forward path: Pending -> Processing -> ExtractingText -> Classifying ->
/// Processed. Failed is reachable from any non-terminal state. Processed and
/// Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    ExtractingText,
    Classifying,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Processed | DocumentStatus::Failed)
    }

    /// Position along the forward path, used to reject backward transitions.
    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Pending => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::ExtractingText => 2,
            DocumentStatus::Classifying => 3,
            DocumentStatus::Processed => 4,
            DocumentStatus::Failed => 4,
        }
    }

    /// True when moving from `self` to `next` follows the state graph.
    /// Terminal states admit no further transitions; Failed is reachable
    /// from anything non-terminal; otherwise only forward moves are allowed.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == DocumentStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::ExtractingText => "EXTRACTING_TEXT",
            DocumentStatus::Classifying => "CLASSIFYING",
            DocumentStatus::Processed => "PROCESSED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentStatus> {
        match s {
            "PENDING" => Some(DocumentStatus::Pending),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "EXTRACTING_TEXT" => Some(DocumentStatus::ExtractingText),
            "CLASSIFYING" => Some(DocumentStatus::Classifying),
            "PROCESSED" => Some(DocumentStatus::Processed),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// One row per uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub blob_key: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(user_id: Uuid, blob_key: String) -> Self {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            user_id,
            blob_key,
            status: DocumentStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The snapshot pushed over the live channel; same shape as the status
    /// query response.
    pub fn to_status_update(&self) -> StatusUpdate {
        StatusUpdate {
            document_id: self.id,
            user_id: self.user_id,
            status: self.status,
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
}

/// A normalized line item produced by the classification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub category: String,
    pub item_type: String,
    pub amount: f64,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub payment_method: Option<String>,
}

// --- Pipeline work messages ---
// All of these ride the broker as JSON and are at-least-once delivered, so
// every field a stage needs must travel with the message.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub blob_key: String,
    pub business_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTask {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub business_date: Option<NaiveDate>,
}

/// One fan-out message per classified item. `item_index` is stable across
/// redeliveries and feeds the transaction-level dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTask {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub item_index: u32,
    pub item: LineItem,
}

// --- Feedback ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Extraction,
    Classification,
    Transaction,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Extraction => "EXTRACTION",
            PipelineStage::Classification => "CLASSIFICATION",
            PipelineStage::Transaction => "TRANSACTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackStatus {
    Started,
    ItemsCount,
    Success,
    Failed,
}

/// Out-of-band event reporting a stage's outcome for one document. Consumed
/// once by the feedback dispatcher; not persisted beyond its side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub stage: PipelineStage,
    pub status: FeedbackStatus,
    pub details: Option<String>,
    /// Set only with `FeedbackStatus::ItemsCount`.
    pub total_items: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackMessage {
    pub fn new(
        document_id: Uuid,
        user_id: Uuid,
        stage: PipelineStage,
        status: FeedbackStatus,
        details: Option<String>,
    ) -> Self {
        FeedbackMessage {
            document_id,
            user_id,
            stage,
            status,
            details,
            total_items: None,
            timestamp: Utc::now(),
        }
    }

    pub fn items_count(document_id: Uuid, user_id: Uuid, total_items: u32) -> Self {
        FeedbackMessage {
            document_id,
            user_id,
            stage: PipelineStage::Classification,
            status: FeedbackStatus::ItemsCount,
            details: None,
            total_items: Some(total_items),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        document_id: Uuid,
        user_id: Uuid,
        stage: PipelineStage,
        details: impl Into<String>,
    ) -> Self {
        FeedbackMessage::new(document_id, user_id, stage, FeedbackStatus::Failed, Some(details.into()))
    }
}

/// Envelope for messages that exhausted their retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub stage: PipelineStage,
    pub reason: String,
    /// Original work message payload, kept for inspection/replay.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(ExtractingText));
        assert!(ExtractingText.can_transition_to(Classifying));
        assert!(Classifying.can_transition_to(Processed));
        // Skipping ahead is fine; only backward moves are rejected.
        assert!(Pending.can_transition_to(Classifying));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        use DocumentStatus::*;
        for from in [Pending, Processing, ExtractingText, Classifying] {
            assert!(from.can_transition_to(Failed), "{from:?} -> Failed");
        }
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        use DocumentStatus::*;
        for next in [Pending, Processing, ExtractingText, Classifying, Processed, Failed] {
            assert!(!Processed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn backward_transitions_are_rejected() {
        use DocumentStatus::*;
        assert!(!Classifying.can_transition_to(ExtractingText));
        assert!(!ExtractingText.can_transition_to(Pending));
    }

    #[test]
    fn status_round_trips_through_db_representation() {
        use DocumentStatus::*;
        for status in [Pending, Processing, ExtractingText, Classifying, Processed, Failed] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("NONSENSE"), None);
    }
}
