// src/clients/classifier.rs

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::data_model::LineItem;
use crate::error::{PipelineError, Result};

/// Classification engine: extracted text in, normalized line items out. The
/// prompt and model behind the endpoint are not our concern.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Vec<LineItem>>;
}

#[derive(Deserialize)]
struct ClassifyResponse {
    items: Vec<LineItem>,
}

pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("classifier client: {}", e)))?;
        Ok(HttpClassifier {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<LineItem>> {
        let url = format!("{}/classify", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("classifier: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ClassificationError(format!(
                "classifier rejected text ({}): {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "classifier returned {}",
                status
            )));
        }

        let parsed: ClassifyResponse = response.json().await.map_err(|e| {
            PipelineError::ClassificationError(format!("malformed classifier response: {}", e))
        })?;

        debug!(items = parsed.items.len(), "Classified text into items");
        Ok(parsed.items)
    }
}
