//! Tenants

use crate::account::{AccountStatus, AccountType, Platform, TransactionAccount};
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

string_enum! {
    /// Tenant lifecycle
    pub enum TenantStatus {
        /// Row created, schema not provisioned
        Created => "TENANT_CREATED",
        /// Schema provisioned
        Provisioned => "TENANT_PROVISIONED",
        /// Serving traffic
        Activated => "TENANT_ACTIVATED",
        /// Disabled
        Deactivated => "TENANT_DEACTIVATED",
    }
}

/// Isolated customer organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id
    pub id: String,
    /// Unique name; the tenant schema is `sdp_<name>`
    pub name: String,
    /// Status
    pub status: TenantStatus,
    /// Whether requests without an explicit tenant resolve to this one
    pub is_default: bool,
    /// Distribution account address (ledger accounts)
    pub distribution_account_address: Option<String>,
    /// Distribution account type
    pub distribution_account_type: Option<AccountType>,
    /// Distribution account status
    pub distribution_account_status: AccountStatus,
    /// Custodial distribution wallet id (Circle accounts)
    pub circle_wallet_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// New tenant without a distribution account
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: TenantStatus::Created,
            is_default: false,
            distribution_account_address: None,
            distribution_account_type: None,
            distribution_account_status: AccountStatus::Active,
            circle_wallet_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a ledger distribution account
    pub fn with_stellar_distribution(
        mut self,
        address: impl Into<String>,
        account_type: AccountType,
    ) -> Self {
        self.distribution_account_address = Some(address.into());
        self.distribution_account_type = Some(account_type);
        self.distribution_account_status = AccountStatus::Active;
        self
    }

    /// Attach a custodial distribution wallet
    pub fn with_circle_distribution(mut self, wallet_id: Option<String>, status: AccountStatus) -> Self {
        self.distribution_account_type = Some(AccountType::DistributionAccountCircleDbVault);
        self.circle_wallet_id = wallet_id;
        self.distribution_account_status = status;
        self
    }

    /// Distribution account described by this tenant's configuration
    pub fn distribution_account(&self) -> Result<TransactionAccount> {
        let invalid = |reason: &str| CoreError::InvalidDistributionAccount {
            tenant: self.name.clone(),
            reason: reason.to_string(),
        };

        let account_type = self
            .distribution_account_type
            .ok_or_else(|| invalid("distribution account type is not set"))?;
        if !account_type.is_distribution() {
            return Err(invalid(&format!(
                "{} is not a distribution account type",
                account_type
            )));
        }

        match account_type.platform() {
            Platform::Stellar => {
                let address = self
                    .distribution_account_address
                    .as_deref()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| invalid("distribution account address is empty"))?;
                Ok(TransactionAccount {
                    address: address.to_string(),
                    account_type,
                    circle_wallet_id: None,
                    status: self.distribution_account_status,
                })
            }
            Platform::Circle => {
                let wallet_id = self.circle_wallet_id.clone().filter(|w| !w.is_empty());
                if wallet_id.is_none() && self.distribution_account_status == AccountStatus::Active {
                    return Err(invalid("active custodial account has no wallet id"));
                }
                Ok(TransactionAccount::circle(
                    wallet_id,
                    self.distribution_account_status,
                ))
            }
        }
    }

    /// Postgres schema holding this tenant's data
    pub fn schema_name(&self) -> String {
        schema_name(&self.name)
    }
}

/// Schema name for a tenant name
pub fn schema_name(tenant_name: &str) -> String {
    format!("sdp_{}", tenant_name)
}

/// Tenant names are restricted so they can be embedded in schema names
pub fn validate_tenant_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 48
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTenantName(name.to_string()))
    }
}
