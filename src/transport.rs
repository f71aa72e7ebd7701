//! Batch upload to the ingest server, and the survey enrollment handshake.
//!
//! Batches are posted as a JSON string under the `data` form field. A failed
//! upload is reported to the caller and never retried here.

use crate::collector::types::Sample;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Where the ingest server lives.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL, e.g. `https://collector.example.org:8080`
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Batch ingest endpoint.
    pub fn store_url(&self) -> String {
        format!("{}/data/store", self.base_url)
    }

    /// Survey submission endpoint.
    pub fn survey_url(&self) -> String {
        format!("{}/survey/store", self.base_url)
    }

    /// Health check endpoint.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

/// Transport error types.
#[derive(Debug)]
pub enum TransportError {
    /// Network/HTTP error
    Network(String),
    /// Server returned an error response
    Server { status: u16, message: String },
    /// The server answered but refused the payload
    Rejected(String),
    /// JSON serialization error
    Serialization(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Network(msg) => write!(f, "transport network error: {msg}"),
            TransportError::Server { status, message } => {
                write!(f, "server error ({status}): {message}")
            }
            TransportError::Rejected(msg) => write!(f, "server rejected request: {msg}"),
            TransportError::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Sends one batch of samples.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, batch: &[Sample]) -> Result<(), TransportError>;
}

/// Acknowledgement returned by `/data/store`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreAck {
    pub done: bool,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// Answer returned by `/survey/store`.
#[derive(Debug, Clone, Deserialize)]
pub struct SurveyAck {
    pub done: bool,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

/// Encode a batch the way the ingest endpoint expects it.
pub fn encode_batch(batch: &[Sample]) -> Result<String, TransportError> {
    serde_json::to_string(batch).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// reqwest-backed transport.
#[cfg(feature = "transport")]
pub struct HttpTransport {
    config: EndpointConfig,
    client: reqwest::Client,
}

#[cfg(feature = "transport")]
impl HttpTransport {
    pub fn new(config: EndpointConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Test connection to the server.
    pub async fn test_connection(&self) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// Submit the enrollment survey and return the assigned user ID.
    pub async fn enroll(
        &self,
        answers: &[(String, String)],
    ) -> Result<String, TransportError> {
        let response = self
            .client
            .post(self.config.survey_url())
            .form(answers)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let ack: SurveyAck = read_json(response).await?;
        match (ack.done, ack.user_id) {
            (true, Some(user_id)) if !user_id.is_empty() => Ok(user_id),
            (_, _) => Err(TransportError::Rejected(
                ack.errors
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no user id assigned".to_string()),
            )),
        }
    }
}

#[cfg(feature = "transport")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[Sample]) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let data = encode_batch(batch)?;
        let response = self
            .client
            .post(self.config.store_url())
            .form(&[("data", data)])
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let ack: StoreAck = read_json(response).await?;
        if !ack.done {
            return Err(TransportError::Rejected(
                ack.errors
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "transport")]
async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(TransportError::Server {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|e| TransportError::Serialization(e.to_string()))
}
