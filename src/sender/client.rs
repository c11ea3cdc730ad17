use crate::sender::retry::IsRetryable;
use crate::sender::Payload;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Backend path pipeline stats are delivered to.
pub const PIPELINE_STATS_PATH: &str = "/api/v0.2/pipeline_stats";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when delivering a payload
#[derive(Debug)]
pub enum SendError {
    Timeout,
    Http { status: u16, endpoint: String },
    Network(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Timeout => write!(f, "request timed out"),
            SendError::Http { status, endpoint } => {
                write!(f, "HTTP {} from {}", status, endpoint)
            }
            SendError::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

impl IsRetryable for SendError {
    fn is_retryable(&self) -> bool {
        match self {
            SendError::Timeout => true,
            SendError::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            SendError::Network(_) => true,
        }
    }
}

/// One delivery attempt of one payload.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<(), SendError>;
}

/// Posts payloads to `{endpoint}/api/v0.2/pipeline_stats`.
pub struct HttpTransport {
    client: Client,
    url: String,
    api_key: String,
}

impl HttpTransport {
    /// Returns an error if the HTTP client fails to build (e.g., TLS configuration issues).
    pub fn new(endpoint: &str, api_key: String) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), PIPELINE_STATS_PATH),
            api_key,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        let mut request = self.client.post(&self.url).body(payload.body.clone());
        for (name, value) in &payload.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !self.api_key.is_empty() {
            request = request.header("DD-Api-Key", self.api_key.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let resp_body = response
                .text()
                .await
                .unwrap_or_else(|_| "(failed to read body)".to_string());
            warn!(
                endpoint = %self.url,
                status,
                response_body = %resp_body,
                "backend returned error status"
            );
            return Err(SendError::Http {
                status,
                endpoint: self.url.clone(),
            });
        }

        debug!(endpoint = %self.url, bytes = payload.len(), "payload delivered");
        Ok(())
    }
}
