//! HTTP client for a ledger anchoring service.
//!
//! Endpoints:
//! - POST {endpoint}/submissions        -> { "ledger_reference": "..." }
//! - GET  {endpoint}/submissions/{ref}  -> { "state": "pending|final|rejected", "confirmations": n }

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{ConfirmationError, ConfirmationSource};
use crate::domain::{LedgerPayload, LedgerStatus};

/// Ledger anchoring service client
pub struct HttpLedgerClient {
    endpoint: String,
    client: reqwest::Client,
}

/// Response from the submission endpoint
#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    ledger_reference: String,
}

impl HttpLedgerClient {
    /// Create a new client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, ConfirmationError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfirmationError::Rejected(format!("invalid HTTP client config: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }
}

/// Map a non-success status to the error taxonomy
fn classify_status(status: StatusCode, body: &str) -> ConfirmationError {
    let message = format!("{}: {}", status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        ConfirmationError::Transient(message)
    } else {
        ConfirmationError::Rejected(message)
    }
}

/// Connection failures, timeouts and undecodable bodies are all retried
fn classify_transport(err: reqwest::Error) -> ConfirmationError {
    ConfirmationError::Transient(err.to_string())
}

#[async_trait]
impl ConfirmationSource for HttpLedgerClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit_fingerprint(&self, payload: &LedgerPayload) -> Result<String, ConfirmationError> {
        let response = self
            .client
            .post(self.url("submissions"))
            .json(payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let body: SubmissionResponse = response.json().await.map_err(classify_transport)?;
        Ok(body.ledger_reference)
    }

    async fn check_status(&self, ledger_reference: &str) -> Result<LedgerStatus, ConfirmationError> {
        let response = self
            .client
            .get(self.url(&format!("submissions/{}", ledger_reference)))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        response.json().await.map_err(classify_transport)
    }
}
