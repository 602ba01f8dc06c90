// Example using thiserror
use thiserror::Error;
use uuid::Uuid;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The Error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidationError(String),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Queueing system error: {0}")]
    QueueError(String),

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Document record store error: {source}")]
    DatabaseError {
        #[from]
        source: sqlx::Error,
    },

    #[error("Document '{0}' not found")]
    DocumentNotFound(Uuid),

    #[error("Processing state store error: {0}")]
    StateStoreError(String),

    #[error("Blob store error: {0}")]
    BlobError(String),

    #[error("Text extraction error: {0}")]
    ExtractionError(String),

    #[error("Classification error: {0}")]
    ClassificationError(String),

    #[error("Transaction collaborator error: {0}")]
    TransactionError(String),

    #[error("Upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

// We could implement From<lapin::Error> here, but since lapin::Error doesn't
// directly implement std::error::Error sometimes, mapping it where it occurs
// and converting to a String might be more straightforward for now.
impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        PipelineError::QueueError(err.to_string())
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::StateStoreError(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::UpstreamUnavailable(err.to_string())
    }
}

impl PipelineError {
    /// Whether retrying the operation that produced this error can help.
    ///
    /// Content-level failures (unreadable document, nonsense text, unknown
    /// document id, malformed payload) are permanent; everything touching the
    /// network or a remote dependency is treated as transient. An open circuit
    /// breaker is not retried either: the breaker already decided the upstream
    /// is down and the caller should fail fast.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::SerializationError { .. }
                | PipelineError::DocumentNotFound(_)
                | PipelineError::ExtractionError(_)
                | PipelineError::ClassificationError(_)
                | PipelineError::ConfigError(_)
                | PipelineError::ConfigValidationError(_)
                | PipelineError::CircuitOpen(_)
        )
    }
}
