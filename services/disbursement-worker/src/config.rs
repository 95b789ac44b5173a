//! Worker configuration

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin database and tenant pools
    pub database: DatabaseConfig,

    /// Event bus
    pub nats: NatsSection,

    /// Ledger API
    pub ledger: LedgerSection,

    /// Signing keys
    pub signing: SigningSection,

    /// Transaction submission
    pub submitter: SubmitterSection,

    /// Custodial provider
    pub custodial: CustodialSection,

    /// Periodic jobs
    pub jobs: JobsSection,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Admin database holding tenants, channel accounts and submitter rows
    pub url: String,

    /// Connection string tenant schemas are derived from
    pub tenant_base_url: String,

    /// Max connections per pool
    pub max_connections: u32,

    /// Idle connections kept per pool
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/sdp".to_string(),
            tenant_base_url: "postgres://localhost:5432/sdp".to_string(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
        }
    }
}

/// NATS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSection {
    /// Server URL
    pub url: String,

    /// JetStream stream name
    pub stream_name: String,

    /// Durable consumer group
    pub consumer_group: String,

    /// Seconds before an unacknowledged message is redelivered
    pub ack_wait_secs: u64,

    /// Deliveries per message
    pub max_deliver: i64,
}

impl Default for NatsSection {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "DISBURSEMENT_EVENTS".to_string(),
            consumer_group: "disbursement-workers".to_string(),
            ack_wait_secs: 30,
            max_deliver: 5,
        }
    }
}

/// Ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Ledger API base URL
    pub url: String,

    /// Network passphrase
    pub network_passphrase: String,

    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Signing configuration. Secrets are hex encoded ed25519 seeds.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSection {
    /// Host account secret
    pub host_account_secret: String,

    /// Distribution account secret, used by the `env` signer
    pub distribution_account_secret: Option<String>,

    /// `env` or `db_vault`
    pub distribution_signer: String,

    /// Passphrase protecting keys stored in the database
    pub encryption_passphrase: String,
}

impl Default for SigningSection {
    fn default() -> Self {
        Self {
            host_account_secret: String::new(),
            distribution_account_secret: None,
            distribution_signer: "db_vault".to_string(),
            encryption_passphrase: String::new(),
        }
    }
}

impl std::fmt::Debug for SigningSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSection")
            .field("distribution_signer", &self.distribution_signer)
            .finish_non_exhaustive()
    }
}

/// Submission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterSection {
    /// Concurrent worker loops
    pub workers: usize,

    /// Rows claimed per pass
    pub processing_limit: usize,

    /// Idle sleep between passes (ms)
    pub poll_interval_ms: u64,

    /// Passes a row gets before it errors
    pub max_attempts: u32,

    /// Fee per operation
    pub base_fee: u32,

    /// Highest fee bump per operation
    pub max_base_fee: u32,

    /// Channel accounts to keep on-chain; 0 leaves the current set alone
    pub channel_accounts: usize,
}

impl Default for SubmitterSection {
    fn default() -> Self {
        Self {
            workers: 2,
            processing_limit: 8,
            poll_interval_ms: 1000,
            max_attempts: 5,
            base_fee: 100,
            max_base_fee: 10_000,
            channel_accounts: 0,
        }
    }
}

/// Custodial provider configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodialSection {
    /// Dispatch custodial tenants
    pub enabled: bool,

    /// Provider base URL
    pub url: String,

    /// API key
    pub api_key: String,

    /// `transfers` or `payouts`
    pub api_type: String,

    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for CustodialSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://api-sandbox.circle.com".to_string(),
            api_key: String::new(),
            api_type: "transfers".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for CustodialSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodialSection")
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("api_type", &self.api_type)
            .finish_non_exhaustive()
    }
}

/// Job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Seconds between ready payment sweeps
    pub ready_payments_interval_secs: u64,

    /// Payments per tenant per sweep
    pub ready_payments_batch_size: usize,

    /// Seconds between custodial reconciliation runs
    pub reconciliation_interval_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            ready_payments_interval_secs: 10,
            ready_payments_batch_size: 100,
            reconciliation_interval_secs: 300,
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from environment variables, reading `.env` first
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from `CONFIG_FILE` when set, then apply environment overrides
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match std::env::var("CONFIG_FILE") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overwrite fields whose variable `lookup` knows
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("TENANT_DATABASE_URL") {
            self.database.tenant_base_url = v;
        }
        if let Some(v) = lookup("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse("DATABASE_MAX_CONNECTIONS", &v)?;
        }

        if let Some(v) = lookup("NATS_URL") {
            self.nats.url = v;
        }
        if let Some(v) = lookup("NATS_CONSUMER_GROUP") {
            self.nats.consumer_group = v;
        }

        if let Some(v) = lookup("LEDGER_URL") {
            self.ledger.url = v;
        }
        if let Some(v) = lookup("NETWORK_PASSPHRASE") {
            self.ledger.network_passphrase = v;
        }

        if let Some(v) = lookup("HOST_ACCOUNT_SECRET") {
            self.signing.host_account_secret = v;
        }
        if let Some(v) = lookup("DISTRIBUTION_ACCOUNT_SECRET") {
            self.signing.distribution_account_secret = Some(v);
        }
        if let Some(v) = lookup("DISTRIBUTION_SIGNER_TYPE") {
            self.signing.distribution_signer = v;
        }
        if let Some(v) = lookup("KEY_ENCRYPTION_PASSPHRASE") {
            self.signing.encryption_passphrase = v;
        }

        if let Some(v) = lookup("SUBMITTER_WORKERS") {
            self.submitter.workers = parse("SUBMITTER_WORKERS", &v)?;
        }
        if let Some(v) = lookup("SUBMITTER_PROCESSING_LIMIT") {
            self.submitter.processing_limit = parse("SUBMITTER_PROCESSING_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SUBMITTER_MAX_BASE_FEE") {
            self.submitter.max_base_fee = parse("SUBMITTER_MAX_BASE_FEE", &v)?;
        }
        if let Some(v) = lookup("CHANNEL_ACCOUNTS") {
            self.submitter.channel_accounts = parse("CHANNEL_ACCOUNTS", &v)?;
        }

        if let Some(v) = lookup("CIRCLE_ENABLED") {
            self.custodial.enabled = parse("CIRCLE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CIRCLE_API_URL") {
            self.custodial.url = v;
        }
        if let Some(v) = lookup("CIRCLE_API_KEY") {
            self.custodial.api_key = v;
        }
        if let Some(v) = lookup("CIRCLE_API_TYPE") {
            self.custodial.api_type = v;
        }

        if let Some(v) = lookup("READY_PAYMENTS_BATCH_SIZE") {
            self.jobs.ready_payments_batch_size = parse("READY_PAYMENTS_BATCH_SIZE", &v)?;
        }

        Ok(())
    }

    /// Reject settings the worker cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signing.host_account_secret.is_empty() {
            bail!("host account secret is not configured");
        }
        if self.signing.encryption_passphrase.is_empty() {
            bail!("key encryption passphrase is not configured");
        }
        match self.signing.distribution_signer.as_str() {
            "db_vault" => {}
            "env" if self.signing.distribution_account_secret.is_some() => {}
            "env" => bail!("the env distribution signer needs a distribution account secret"),
            other => bail!("unknown distribution signer {:?}", other),
        }
        if !matches!(self.custodial.api_type.as_str(), "transfers" | "payouts") {
            bail!("unknown custodial api type {:?}", self.custodial.api_type);
        }
        if self.custodial.enabled && self.custodial.api_key.is_empty() {
            bail!("custodial dispatch is enabled without an api key");
        }
        if self.submitter.workers == 0 {
            bail!("at least one submitter worker is required");
        }
        Ok(())
    }

    /// Pool acquire timeout
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database.acquire_timeout_secs)
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value {:?} for {}: {}", value, key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        let mut config = Config::default();
        config.signing.host_account_secret = "11".repeat(32);
        config.signing.encryption_passphrase = "passphrase".to_string();
        config
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            url = "postgres://db/admin"

            [jobs]
            ready_payments_batch_size = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.database.url, "postgres://db/admin");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.jobs.ready_payments_batch_size, 25);
        assert_eq!(config.jobs.reconciliation_interval_secs, 300);
        assert_eq!(config.nats, NatsSection::default());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config: Config = toml::from_str("[submitter]\nworkers = 4\n").unwrap();
        let vars: HashMap<&str, &str> = [
            ("SUBMITTER_WORKERS", "6"),
            ("CIRCLE_ENABLED", "true"),
            ("DISTRIBUTION_ACCOUNT_SECRET", "abcd"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.submitter.workers, 6);
        assert!(config.custodial.enabled);
        assert_eq!(config.signing.distribution_account_secret.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_bad_number_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "CHANNEL_ACCOUNTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CHANNEL_ACCOUNTS"));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut env_signer = valid();
        env_signer.signing.distribution_signer = "env".to_string();
        assert!(env_signer.validate().is_err());
        env_signer.signing.distribution_account_secret = Some("22".repeat(32));
        assert!(env_signer.validate().is_ok());

        let mut custodial = valid();
        custodial.custodial.enabled = true;
        assert!(custodial.validate().is_err());
        custodial.custodial.api_key = "key".to_string();
        custodial.custodial.api_type = "wires".to_string();
        assert!(custodial.validate().is_err());
    }

    #[test]
    fn test_secrets_stay_out_of_debug() {
        let mut config = valid();
        config.custodial.api_key = "super-secret-key".to_string();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("super-secret-key"));
        assert!(!printed.contains(&"11".repeat(32)));
    }
}
