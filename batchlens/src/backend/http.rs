//! Generic HTTP classification backend.
//!
//! Posts the work item to a JSON endpoint implementing the classify
//! contract and maps HTTP failures onto the error taxonomy.

use super::Backend;
use crate::core::{Classification, WorkItem};
use crate::errors::ClassifyError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for an HTTP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Registry name for this backend.
    pub name: String,
    /// Endpoint URL receiving classify requests.
    pub endpoint: String,
    /// Bearer token, if the service requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    id: &'a str,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    category: String,
    confidence: f64,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    tokens: Option<u32>,
}

/// Backend that classifies through a remote JSON endpoint.
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Builds the backend and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the client cannot be constructed.
    pub fn new(config: HttpBackendConfig) -> Result<Self, ClassifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClassifyError::validation(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> ClassifyError {
        let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
        match status.as_u16() {
            429 => ClassifyError::rate_limited(message),
            401 | 403 => ClassifyError::authentication(message),
            400 | 422 => ClassifyError::validation(message),
            500..=599 => ClassifyError::network(message),
            _ => ClassifyError::unknown(message),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn classify(&self, item: &WorkItem) -> Result<Classification, ClassifyError> {
        let request = ClassifyRequest {
            id: &item.id,
            source: &item.source,
            title: item.title.as_deref(),
            description: item.description.as_deref(),
        };

        let started = Instant::now();
        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifyError::timeout(e.to_string())
            } else {
                ClassifyError::network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::unknown(format!("malformed response: {e}")))?;

        Ok(Classification {
            category: parsed.category,
            confidence: parsed.confidence,
            cost_usd: parsed.cost_usd,
            latency_ms: started.elapsed().as_millis() as u64,
            tokens: parsed.tokens,
        })
    }
}
