// src/clients/extractor.rs

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Text extraction engine. The OCR implementation behind the HTTP endpoint is
/// an external capability; all we require is bytes in, text out.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, blob_key: &str, content: &[u8]) -> Result<String>;
}

#[derive(Deserialize)]
struct ExtractResponse {
    text: String,
}

pub struct HttpTextExtractor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTextExtractor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigError(format!("extractor client: {}", e)))?;
        Ok(HttpTextExtractor {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl TextExtractor for HttpTextExtractor {
    async fn extract(&self, blob_key: &str, content: &[u8]) -> Result<String> {
        let url = format!("{}/extract", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("blob_key", blob_key)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("extractor: {}", e)))?;

        // 4xx means the engine looked at the document and gave up: permanent.
        // Everything else (5xx, transport) is transient and retryable.
        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ExtractionError(format!(
                "extractor rejected document ({}): {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "extractor returned {}",
                status
            )));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ExtractionError(format!("malformed extractor response: {}", e)))?;

        if parsed.text.trim().is_empty() {
            return Err(PipelineError::ExtractionError(
                "extractor produced no text".to_string(),
            ));
        }

        debug!(blob_key = %blob_key, chars = parsed.text.len(), "Extracted text");
        Ok(parsed.text)
    }
}
