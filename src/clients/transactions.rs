// src/clients/transactions.rs

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::data_model::TransactionTask;
use crate::error::{PipelineError, Result};

/// The transaction service that materializes one classified item into a
/// transaction row. CRUD lives on the other side of this trait.
#[async_trait]
pub trait TransactionGateway: Send + Sync {
    async fn create_transaction(&self, task: &TransactionTask) -> Result<()>;
}

pub struct HttpTransactionGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransactionGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("transactions client: {}", e)))?;
        Ok(HttpTransactionGateway {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl TransactionGateway for HttpTransactionGateway {
    async fn create_transaction(&self, task: &TransactionTask) -> Result<()> {
        let url = format!("{}/transactions", self.base_url);
        // Fan-out messages are at-least-once; the dedup key lets the
        // transaction service drop replays instead of double-booking.
        let dedup_key = format!("{}:{}", task.document_id, task.item_index);
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &dedup_key)
            .json(task)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("transactions: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::TransactionError(format!(
                "transaction rejected ({}): {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "transactions returned {}",
                status
            )));
        }

        debug!(document_id = %task.document_id, item_index = task.item_index, "Created transaction");
        Ok(())
    }
}
