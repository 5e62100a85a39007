//! # Backend Gateway
//!
//! One physical HTTP call per [`BackendGateway::invoke`]. Retrying and
//! circuit breaking happen above this layer, in the route's
//! [`resilience::ResilienceClient`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use config_rs::BackendSettings;
use resilience::{Classify, FailureClass};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::operation::{OperationRequest, OperationType};

/// Longest response body excerpt kept in an error
const ERROR_BODY_LIMIT: usize = 512;

/// A 2xx backend answer
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Value,
    pub latency: Duration,
}

/// Failures of a single backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("backend rejected request with {status}: {body}")]
    Client { status: u16, body: String },

    #[error("backend response could not be decoded: {0}")]
    InvalidResponse(String),

    #[error("backend request could not be built: {0}")]
    Request(String),
}

impl BackendError {
    /// HTTP status, if the backend answered
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Server { status, .. } | BackendError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else if err.is_connect() {
            BackendError::Connection(err.to_string())
        } else if err.is_builder() {
            BackendError::Request(err.to_string())
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            // Includes bodies cut off by a dropped connection
            BackendError::Connection(err.to_string())
        }
    }
}

impl Classify for BackendError {
    fn failure_class(&self) -> FailureClass {
        match self {
            BackendError::Timeout(_) | BackendError::Connection(_) | BackendError::Server { .. } => {
                FailureClass::Transient
            }
            BackendError::Client { .. } | BackendError::InvalidResponse(_) | BackendError::Request(_) => {
                FailureClass::Permanent
            }
        }
    }
}

/// Invokes one backend operation
#[async_trait]
pub trait BackendGateway: Send + Sync {
    async fn invoke(&self, request: &OperationRequest) -> Result<RawResponse, BackendError>;
}

/// `reqwest` implementation against the intelligence service
#[derive(Debug, Clone)]
pub struct HttpBackendGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBackendGateway {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout())
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            timeout: settings.timeout(),
        })
    }

    pub fn endpoint_url(&self, operation: OperationType) -> String {
        format!("{}{}", self.base_url, operation.endpoint())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl BackendGateway for HttpBackendGateway {
    async fn invoke(&self, request: &OperationRequest) -> Result<RawResponse, BackendError> {
        let url = self.endpoint_url(request.operation_type);
        let started = Instant::now();

        debug!(operation = %request.operation_type, url = %url, "Invoking backend");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&request.body())
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        let latency = started.elapsed();

        metrics::histogram!(
            "intelligence_adapter.backend.latency_ms",
            latency.as_millis() as f64,
            "route" => request.operation_type.as_str()
        );
        metrics::counter!(
            "intelligence_adapter.backend.calls",
            1,
            "route" => request.operation_type.as_str(),
            "status" => status.to_string()
        );

        match status {
            200..=299 => {
                let body = if text.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&text).map_err(|e| BackendError::InvalidResponse(e.to_string()))?
                };
                debug!(
                    operation = %request.operation_type,
                    status = %status,
                    latency_ms = %latency.as_millis(),
                    "Backend call succeeded"
                );
                Ok(RawResponse { status, body, latency })
            }
            500..=599 => {
                warn!(operation = %request.operation_type, status = %status, "Backend server error");
                Err(BackendError::Server {
                    status,
                    body: excerpt(&text),
                })
            }
            _ => {
                warn!(operation = %request.operation_type, status = %status, "Backend rejected request");
                Err(BackendError::Client {
                    status,
                    body: excerpt(&text),
                })
            }
        }
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
