//! HTTP custodial client

use super::{
    currency_for_asset, CustodialClient, Payout, PayoutRequest, Recipient, RecipientRequest,
    Transfer, TransferRequest, STELLAR_CHAIN_CODE,
};
use crate::metrics::{CUSTODIAL_REQUESTS, CUSTODIAL_REQUEST_DURATION};
use crate::{CustodialApiError, DispatchError, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct CustodialHttpConfig {
    /// Base URL of the provider API
    pub base_url: String,
    /// API key sent as a bearer token
    pub api_key: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retries after a 429 before giving up
    pub max_rate_limit_retries: u32,
}

impl Default for CustodialHttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api-sandbox.circle.com".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(30),
            max_rate_limit_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ApiProblem {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Custodial client speaking the provider's JSON REST API
pub struct CustodialHttpClient {
    http: reqwest::Client,
    config: CustodialHttpConfig,
}

impl CustodialHttpClient {
    /// Create a new client
    pub fn new(config: CustodialHttpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DispatchError::CustodialTransport(e.to_string()))?;

        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &'static str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let mut rate_limited = 0;
        loop {
            let started = Instant::now();
            let mut builder = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&self.config.api_key);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| DispatchError::CustodialTransport(e.to_string()))?;
            let status = response.status();

            CUSTODIAL_REQUESTS
                .with_label_values(&[endpoint, status.as_str()])
                .inc();
            CUSTODIAL_REQUEST_DURATION
                .with_label_values(&[endpoint])
                .observe(started.elapsed().as_secs_f64());

            if status == StatusCode::TOO_MANY_REQUESTS && rate_limited < self.config.max_rate_limit_retries {
                rate_limited += 1;
                let wait = retry_after(&response).unwrap_or(Duration::from_secs(1));
                warn!(endpoint, attempt = rate_limited, wait_ms = wait.as_millis() as u64, "Custodial API rate limited");
                tokio::time::sleep(wait).await;
                continue;
            }

            return Self::decode(response).await;
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::CustodialTransport(e.to_string()))?;

        if status.is_success() {
            let envelope: DataEnvelope<T> = serde_json::from_str(&body)?;
            return Ok(envelope.data);
        }

        let problem: Option<ApiProblem> = serde_json::from_str(&body).ok();
        let (code, message) = match problem {
            Some(p) if !p.message.is_empty() => (p.code, p.message),
            Some(p) => (p.code, body),
            None => (0, body),
        };
        Err(DispatchError::Custodial(CustodialApiError {
            status_code: status.as_u16(),
            code,
            message,
        }))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl CustodialClient for CustodialHttpClient {
    async fn send_transfer(&self, request: &TransferRequest) -> Result<Transfer> {
        let body = json!({
            "idempotencyKey": request.idempotency_key,
            "source": { "type": "wallet", "id": request.source_wallet_id },
            "destination": {
                "type": "blockchain",
                "address": request.destination_address,
                "addressTag": request.destination_memo,
                "chain": STELLAR_CHAIN_CODE,
            },
            "amount": {
                "amount": request.amount,
                "currency": currency_for_asset(&request.asset_code)?,
            },
        });
        debug!(idempotency_key = %request.idempotency_key, "Posting custodial transfer");
        self.request(Method::POST, "transfers", "v1/transfers", Some(&body))
            .await
    }

    async fn get_transfer_by_id(&self, id: &str) -> Result<Transfer> {
        self.request(Method::GET, "transfers", &format!("v1/transfers/{}", id), None)
            .await
    }

    async fn send_payout(&self, request: &PayoutRequest) -> Result<Payout> {
        let currency = currency_for_asset(&request.asset_code)?;
        let body = json!({
            "idempotencyKey": request.idempotency_key,
            "source": { "type": "wallet", "id": request.source_wallet_id },
            "destination": { "type": "address_book", "id": request.recipient_id },
            "amount": { "amount": request.amount, "currency": currency },
            "toAmount": { "currency": currency },
        });
        debug!(idempotency_key = %request.idempotency_key, "Posting custodial payout");
        self.request(Method::POST, "payouts", "v1/payouts", Some(&body))
            .await
    }

    async fn get_payout_by_id(&self, id: &str) -> Result<Payout> {
        self.request(Method::GET, "payouts", &format!("v1/payouts/{}", id), None)
            .await
    }

    async fn post_recipient(&self, request: &RecipientRequest) -> Result<Recipient> {
        let body = json!({
            "idempotencyKey": request.idempotency_key,
            "chain": request.chain,
            "address": request.address,
            "addressTag": request.address_tag,
            "metadata": { "nickname": request.nickname },
        });
        self.request(
            Method::POST,
            "recipients",
            "v1/addressBook/recipients",
            Some(&body),
        )
        .await
    }
}
