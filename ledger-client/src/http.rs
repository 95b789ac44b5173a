//! HTTP ledger client

use crate::client::{AccountDetail, LedgerClient, SubmitResponse, TransactionRecord};
use crate::error::ResultCodes;
use crate::transaction::TransactionEnvelope;
use crate::{LedgerError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    /// Base URL of the ledger API
    pub base_url: String,
    /// Network passphrase
    pub network_passphrase: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpLedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    extras: Option<ProblemExtras>,
}

#[derive(Debug, Deserialize)]
struct ProblemExtras {
    result_codes: Option<ResultCodes>,
}

/// Ledger client speaking the JSON REST API
pub struct HttpLedgerClient {
    http: reqwest::Client,
    config: HttpLedgerConfig,
}

impl HttpLedgerClient {
    /// Create a new client
    pub fn new(config: HttpLedgerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| LedgerError::Serialization(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let problem: Option<Problem> = serde_json::from_str(&body).ok();

        if status == StatusCode::NOT_FOUND {
            return Err(LedgerError::NotFound(what.to_string()));
        }

        if let Some(codes) = problem
            .as_ref()
            .and_then(|p| p.extras.as_ref())
            .and_then(|e| e.result_codes.clone())
        {
            return Err(LedgerError::Rejected(codes));
        }

        let detail = match problem {
            Some(p) if !p.detail.is_empty() => p.detail,
            Some(p) => p.title,
            None => body,
        };
        Err(LedgerError::Http {
            status: status.as_u16(),
            detail,
        })
    }
}

fn transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else {
        LedgerError::Transport(err.to_string())
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn network_passphrase(&self) -> &str {
        &self.config.network_passphrase
    }

    async fn account(&self, address: &str) -> Result<AccountDetail> {
        let response = self
            .http
            .get(self.url(&format!("accounts/{}", address)))
            .send()
            .await
            .map_err(transport_error)?;

        Self::decode(response, &format!("account {}", address)).await
    }

    async fn submit(&self, envelope: &TransactionEnvelope) -> Result<SubmitResponse> {
        let hash = envelope.hash_hex(&self.config.network_passphrase)?;
        debug!(tx_hash = %hash, "Submitting transaction");

        let response = self
            .http
            .post(self.url("transactions"))
            .json(envelope)
            .send()
            .await
            .map_err(transport_error)?;

        let result = Self::decode(response, &format!("transaction {}", hash)).await;
        if let Err(e) = &result {
            warn!(tx_hash = %hash, error = %e, "Transaction submission failed");
        }
        result
    }

    async fn transaction(&self, hash: &str) -> Result<TransactionRecord> {
        let response = self
            .http
            .get(self.url(&format!("transactions/{}", hash)))
            .send()
            .await
            .map_err(transport_error)?;

        Self::decode(response, &format!("transaction {}", hash)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = HttpLedgerClient::new(HttpLedgerConfig {
            base_url: "https://ledger.example.org/".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            client.url("accounts/abc"),
            "https://ledger.example.org/accounts/abc"
        );
    }

    #[test]
    fn test_problem_with_result_codes_parses() {
        let body = r#"{
            "title": "Transaction Failed",
            "detail": "",
            "extras": {"result_codes": {"transaction": "tx_failed", "operations": ["op_underfunded"]}}
        }"#;
        let problem: Problem = serde_json::from_str(body).unwrap();
        let codes = problem.extras.unwrap().result_codes.unwrap();
        assert_eq!(codes.operations, vec!["op_underfunded".to_string()]);
    }
}
