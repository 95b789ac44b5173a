//! Transaction accounts: host, channel and distribution accounts

use serde::{Deserialize, Serialize};

string_enum! {
    /// Account role combined with where its signing material lives
    pub enum AccountType {
        /// Host account, secret from the environment
        HostStellarEnv => "HOST.STELLAR.ENV",
        /// Channel account, encrypted secret in the database
        ChannelAccountStellarDb => "CHANNEL_ACCOUNT.STELLAR.DB",
        /// Distribution account, secret from the environment
        DistributionAccountStellarEnv => "DISTRIBUTION_ACCOUNT.STELLAR.ENV",
        /// Distribution account, encrypted secret in the database vault
        DistributionAccountStellarDbVault => "DISTRIBUTION_ACCOUNT.STELLAR.DB_VAULT",
        /// Distribution wallet held by the custodial processor
        DistributionAccountCircleDbVault => "DISTRIBUTION_ACCOUNT.CIRCLE.DB_VAULT",
    }
}

impl AccountType {
    /// Settlement rail this account type belongs to
    pub fn platform(&self) -> Platform {
        match self {
            AccountType::DistributionAccountCircleDbVault => Platform::Circle,
            _ => Platform::Stellar,
        }
    }

    /// Whether the account can act as a tenant distribution account
    pub fn is_distribution(&self) -> bool {
        matches!(
            self,
            AccountType::DistributionAccountStellarEnv
                | AccountType::DistributionAccountStellarDbVault
                | AccountType::DistributionAccountCircleDbVault
        )
    }
}

string_enum! {
    /// Settlement rail
    pub enum Platform {
        /// Signed ledger transactions
        Stellar => "STELLAR",
        /// Custodial payment processor
        Circle => "CIRCLE",
    }
}

string_enum! {
    /// Lifecycle of a transaction account
    pub enum AccountStatus {
        /// Usable
        Active => "ACTIVE",
        /// Waiting for the tenant to finish configuration
        PendingUserActivation => "PENDING_USER_ACTIVATION",
        /// Retired
        Deactivated => "DEACTIVATED",
    }
}

/// Distribution, host or channel account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAccount {
    /// Ledger address, empty for custodial wallets
    pub address: String,
    /// Account type
    pub account_type: AccountType,
    /// Custodial wallet id, for Circle accounts
    pub circle_wallet_id: Option<String>,
    /// Status
    pub status: AccountStatus,
}

impl TransactionAccount {
    /// Host account
    pub fn host(address: impl Into<String>) -> Self {
        Self::stellar(address, AccountType::HostStellarEnv)
    }

    /// Channel account
    pub fn channel(address: impl Into<String>) -> Self {
        Self::stellar(address, AccountType::ChannelAccountStellarDb)
    }

    /// Active ledger account of the given type
    pub fn stellar(address: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            address: address.into(),
            account_type,
            circle_wallet_id: None,
            status: AccountStatus::Active,
        }
    }

    /// Custodial distribution wallet
    pub fn circle(wallet_id: Option<String>, status: AccountStatus) -> Self {
        Self {
            address: String::new(),
            account_type: AccountType::DistributionAccountCircleDbVault,
            circle_wallet_id: wallet_id,
            status,
        }
    }

    /// Address for ledger accounts, wallet id for custodial ones
    pub fn id(&self) -> &str {
        match self.platform() {
            Platform::Stellar => &self.address,
            Platform::Circle => self.circle_wallet_id.as_deref().unwrap_or_default(),
        }
    }

    /// Settlement rail
    pub fn platform(&self) -> Platform {
        self.account_type.platform()
    }

    /// Whether the account is active
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}
