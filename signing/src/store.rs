//! Storage for encrypted signing keys

use crate::{Result, SigningError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encrypted key row
#[derive(Clone, PartialEq, Eq)]
pub struct StoredSigner {
    /// Account address
    pub public_key: String,
    /// Encrypted secret
    pub encrypted_private_key: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for StoredSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSigner")
            .field("public_key", &self.public_key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Persistence for encrypted keys
#[async_trait]
pub trait SignerKeyStore: Send + Sync {
    /// Insert new keys in one statement
    async fn batch_insert(&self, signers: &[StoredSigner]) -> Result<()>;

    /// Key for an address
    async fn get(&self, public_key: &str) -> Result<StoredSigner>;

    /// Delete the key for an address
    async fn delete(&self, public_key: &str) -> Result<()>;

    /// All keys, oldest first
    async fn list(&self) -> Result<Vec<StoredSigner>>;

    /// Number of keys
    async fn count(&self) -> Result<usize>;
}

/// Table a Postgres key store reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerTable {
    /// `channel_accounts`
    ChannelAccounts,
    /// `distribution_account_vault`
    DistributionAccountVault,
}

impl SignerTable {
    fn name(&self) -> &'static str {
        match self {
            SignerTable::ChannelAccounts => "channel_accounts",
            SignerTable::DistributionAccountVault => "distribution_account_vault",
        }
    }
}

/// Key store in the admin database
pub struct PgSignerKeyStore {
    db_pool: Arc<PgPool>,
    table: SignerTable,
}

impl PgSignerKeyStore {
    /// Create a store over `table`
    pub fn new(db_pool: Arc<PgPool>, table: SignerTable) -> Self {
        Self { db_pool, table }
    }
}

#[async_trait]
impl SignerKeyStore for PgSignerKeyStore {
    async fn batch_insert(&self, signers: &[StoredSigner]) -> Result<()> {
        let public_keys: Vec<String> = signers.iter().map(|s| s.public_key.clone()).collect();
        let private_keys: Vec<String> = signers
            .iter()
            .map(|s| s.encrypted_private_key.clone())
            .collect();

        let query = format!(
            "INSERT INTO {} (public_key, private_key) SELECT * FROM UNNEST($1::text[], $2::text[])",
            self.table.name()
        );
        sqlx::query(&query)
            .bind(&public_keys)
            .bind(&private_keys)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn get(&self, public_key: &str) -> Result<StoredSigner> {
        let query = format!(
            "SELECT public_key, private_key, created_at FROM {} WHERE public_key = $1",
            self.table.name()
        );
        let row = sqlx::query(&query)
            .bind(public_key)
            .fetch_optional(&*self.db_pool)
            .await?
            .ok_or_else(|| SigningError::AccountNotFound(public_key.to_string()))?;

        Ok(StoredSigner {
            public_key: row.try_get("public_key")?,
            encrypted_private_key: row.try_get("private_key")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn delete(&self, public_key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE public_key = $1", self.table.name());
        let result = sqlx::query(&query)
            .bind(public_key)
            .execute(&*self.db_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SigningError::AccountNotFound(public_key.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredSigner>> {
        let query = format!(
            "SELECT public_key, private_key, created_at FROM {} ORDER BY created_at, public_key",
            self.table.name()
        );
        let rows = sqlx::query(&query).fetch_all(&*self.db_pool).await?;

        rows.iter()
            .map(|row| {
                Ok(StoredSigner {
                    public_key: row.try_get("public_key")?,
                    encrypted_private_key: row.try_get("private_key")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<usize> {
        let query = format!("SELECT COUNT(*) AS total FROM {}", self.table.name());
        let row = sqlx::query(&query).fetch_one(&*self.db_pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as usize)
    }
}

/// Key store held in memory
#[derive(Default)]
pub struct InMemorySignerKeyStore {
    signers: RwLock<BTreeMap<String, StoredSigner>>,
}

impl InMemorySignerKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignerKeyStore for InMemorySignerKeyStore {
    async fn batch_insert(&self, signers: &[StoredSigner]) -> Result<()> {
        let mut stored = self.signers.write();
        for signer in signers {
            stored.insert(signer.public_key.clone(), signer.clone());
        }
        Ok(())
    }

    async fn get(&self, public_key: &str) -> Result<StoredSigner> {
        self.signers
            .read()
            .get(public_key)
            .cloned()
            .ok_or_else(|| SigningError::AccountNotFound(public_key.to_string()))
    }

    async fn delete(&self, public_key: &str) -> Result<()> {
        self.signers
            .write()
            .remove(public_key)
            .map(|_| ())
            .ok_or_else(|| SigningError::AccountNotFound(public_key.to_string()))
    }

    async fn list(&self) -> Result<Vec<StoredSigner>> {
        let mut signers: Vec<StoredSigner> = self.signers.read().values().cloned().collect();
        signers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.public_key.cmp(&b.public_key))
        });
        Ok(signers)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.signers.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(key: &str) -> StoredSigner {
        StoredSigner {
            public_key: key.to_string(),
            encrypted_private_key: format!("enc-{}", key),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySignerKeyStore::new();
        store.batch_insert(&[signer("a"), signer("b")]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.get("a").await.unwrap().encrypted_private_key, "enc-a");

        store.delete("a").await.unwrap();
        assert!(matches!(
            store.delete("a").await,
            Err(SigningError::AccountNotFound(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_debug_hides_ciphertext() {
        let rendered = format!("{:?}", signer("a"));
        assert!(!rendered.contains("enc-a"));
    }
}
