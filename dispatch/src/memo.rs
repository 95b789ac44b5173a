//! Memo attached to outgoing payments

use crate::store::OrganizationStore;
use crate::Result;
use disbursement_core::ReceiverWallet;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Prefix of tracing memos
pub const TRACING_MEMO_PREFIX: &str = "sdp-";

const TRACING_MEMO_HASH_LEN: usize = 24;

/// Memo value and type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMemo {
    /// Memo value
    pub value: String,
    /// Memo type (`text`, `id` or `hash`)
    pub memo_type: String,
}

/// Picks the memo for a payment: the receiver's own memo, else a tracing memo when the
/// organization enabled them, else none
pub struct MemoResolver {
    organizations: Arc<dyn OrganizationStore>,
}

impl MemoResolver {
    /// Create a resolver over the tenant's organization settings
    pub fn new(organizations: Arc<dyn OrganizationStore>) -> Self {
        Self { organizations }
    }

    /// Memo for a payment to `wallet`
    pub async fn get_memo(&self, wallet: &ReceiverWallet) -> Result<Option<ResolvedMemo>> {
        if let Some(value) = wallet.stellar_memo.as_deref().filter(|m| !m.is_empty()) {
            return Ok(Some(ResolvedMemo {
                value: value.to_string(),
                memo_type: wallet
                    .stellar_memo_type
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "text".to_string()),
            }));
        }

        let organization = self.organizations.get().await?;
        if !organization.memo_tracing_enabled {
            return Ok(None);
        }
        Ok(Some(ResolvedMemo {
            value: tracing_memo(&organization.name),
            memo_type: "text".to_string(),
        }))
    }
}

/// Text memo identifying the sending organization, 28 bytes long
pub fn tracing_memo(organization_name: &str) -> String {
    let digest = hex::encode(Sha256::digest(organization_name.as_bytes()));
    format!("{}{}", TRACING_MEMO_PREFIX, &digest[..TRACING_MEMO_HASH_LEN])
}
