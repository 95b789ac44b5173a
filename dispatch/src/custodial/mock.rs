//! In-memory custodial provider

use super::{
    CustodialClient, Payout, PayoutRequest, Recipient, RecipientRequest, Transfer,
    TransferRequest,
};
use crate::{CustodialApiError, DispatchError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    transfers: HashMap<String, Transfer>,
    payouts: HashMap<String, Payout>,
    by_idempotency_key: HashMap<String, String>,
    recipients_by_key: HashMap<String, Recipient>,
    transfer_requests: Vec<TransferRequest>,
    payout_requests: Vec<PayoutRequest>,
    recipient_requests: Vec<RecipientRequest>,
    failures: VecDeque<CustodialApiError>,
    lookup_failures: VecDeque<CustodialApiError>,
    recipient_statuses: VecDeque<String>,
    initial_status: String,
}

/// Custodial provider kept in memory. Replayed idempotency keys return the object
/// created by the first request.
pub struct MockCustodialClient {
    state: Mutex<MockState>,
    latency: Duration,
}

impl Default for MockCustodialClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCustodialClient {
    /// Provider creating transfers and payouts as `pending`
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                initial_status: "pending".to_string(),
                ..Default::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// Delay every creating call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Status reported for newly created transfers and payouts
    pub fn set_initial_status(&self, status: &str) {
        self.state.lock().initial_status = status.to_string();
    }

    /// Fail the next creating call with `error`
    pub fn fail_next(&self, error: CustodialApiError) {
        self.state.lock().failures.push_back(error);
    }

    /// Fail the next lookup with `error`
    pub fn fail_next_lookup(&self, error: CustodialApiError) {
        self.state.lock().lookup_failures.push_back(error);
    }

    /// Statuses returned by the next recipient creations, in order; `active` afterwards
    pub fn script_recipient_statuses<I, S>(&self, statuses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .recipient_statuses
            .extend(statuses.into_iter().map(Into::into));
    }

    /// Settle a transfer or payout with a ledger hash
    pub fn complete(&self, id: &str, transaction_hash: &str) {
        self.set_outcome(id, "complete", Some(transaction_hash.to_string()), None);
    }

    /// Fail a transfer or payout with a provider error code
    pub fn fail(&self, id: &str, error_code: &str) {
        self.set_outcome(id, "failed", None, Some(error_code.to_string()));
    }

    fn set_outcome(&self, id: &str, status: &str, hash: Option<String>, error_code: Option<String>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        for object in [state.transfers.get_mut(id), state.payouts.get_mut(id)]
            .into_iter()
            .flatten()
        {
            object.status = status.to_string();
            object.transaction_hash = hash.clone();
            object.error_code = error_code.clone();
        }
    }

    /// Transfer requests received, including replays
    pub fn transfer_requests(&self) -> Vec<TransferRequest> {
        self.state.lock().transfer_requests.clone()
    }

    /// Payout requests received, including replays
    pub fn payout_requests(&self) -> Vec<PayoutRequest> {
        self.state.lock().payout_requests.clone()
    }

    /// Recipient requests received
    pub fn recipient_requests(&self) -> Vec<RecipientRequest> {
        self.state.lock().recipient_requests.clone()
    }

    /// Distinct transfers and payouts created
    pub fn created_count(&self) -> usize {
        let state = self.state.lock();
        state.transfers.len() + state.payouts.len()
    }

    fn create(state: &mut MockState, idempotency_key: &str, payout: bool) -> Transfer {
        if let Some(id) = state.by_idempotency_key.get(idempotency_key) {
            let existing = if payout {
                state.payouts.get(id)
            } else {
                state.transfers.get(id)
            };
            if let Some(existing) = existing {
                return existing.clone();
            }
        }

        let created = Transfer {
            id: Uuid::new_v4().to_string(),
            status: state.initial_status.clone(),
            transaction_hash: None,
            error_code: None,
        };
        state
            .by_idempotency_key
            .insert(idempotency_key.to_string(), created.id.clone());
        if payout {
            state.payouts.insert(created.id.clone(), created.clone());
        } else {
            state.transfers.insert(created.id.clone(), created.clone());
        }
        created
    }
}

fn not_found(id: &str) -> DispatchError {
    DispatchError::Custodial(CustodialApiError {
        status_code: 404,
        code: 404,
        message: format!("{} not found", id),
    })
}

#[async_trait]
impl CustodialClient for MockCustodialClient {
    async fn send_transfer(&self, request: &TransferRequest) -> Result<Transfer> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.transfer_requests.push(request.clone());
        if let Some(error) = state.failures.pop_front() {
            return Err(error.into());
        }
        Ok(Self::create(&mut state, &request.idempotency_key, false))
    }

    async fn get_transfer_by_id(&self, id: &str) -> Result<Transfer> {
        let mut state = self.state.lock();
        if let Some(error) = state.lookup_failures.pop_front() {
            return Err(error.into());
        }
        state.transfers.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn send_payout(&self, request: &PayoutRequest) -> Result<Payout> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.payout_requests.push(request.clone());
        if let Some(error) = state.failures.pop_front() {
            return Err(error.into());
        }
        Ok(Self::create(&mut state, &request.idempotency_key, true))
    }

    async fn get_payout_by_id(&self, id: &str) -> Result<Payout> {
        let mut state = self.state.lock();
        if let Some(error) = state.lookup_failures.pop_front() {
            return Err(error.into());
        }
        state.payouts.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn post_recipient(&self, request: &RecipientRequest) -> Result<Recipient> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.recipient_requests.push(request.clone());
        if let Some(error) = state.failures.pop_front() {
            return Err(error.into());
        }

        let status = state
            .recipient_statuses
            .pop_front()
            .unwrap_or_else(|| "active".to_string());
        let recipient = state
            .recipients_by_key
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| Recipient {
                id: Uuid::new_v4().to_string(),
                status: status.clone(),
            });
        recipient.status = status;
        Ok(recipient.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(key: &str) -> TransferRequest {
        TransferRequest {
            idempotency_key: key.to_string(),
            source_wallet_id: "wallet-1".to_string(),
            destination_address: "GDEST".to_string(),
            destination_memo: None,
            amount: "10.00".to_string(),
            asset_code: "USDC".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replayed_key_returns_same_transfer() {
        let client = MockCustodialClient::new();
        let first = client.send_transfer(&transfer("k1")).await.unwrap();
        let replay = client.send_transfer(&transfer("k1")).await.unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(client.created_count(), 1);
        assert_eq!(client.transfer_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_and_settlement() {
        let client = MockCustodialClient::new();
        client.fail_next(CustodialApiError {
            status_code: 400,
            code: 2,
            message: "insufficient funds".to_string(),
        });
        assert!(client.send_transfer(&transfer("k1")).await.is_err());

        let created = client.send_transfer(&transfer("k1")).await.unwrap();
        client.complete(&created.id, "hash-1");
        let settled = client.get_transfer_by_id(&created.id).await.unwrap();
        assert_eq!(settled.status, "complete");
        assert_eq!(settled.transaction_hash.as_deref(), Some("hash-1"));
    }
}
