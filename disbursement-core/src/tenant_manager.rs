//! Tenant lookup and connection strings

use crate::account::{AccountStatus, AccountType};
use crate::tenant::{schema_name, validate_tenant_name, Tenant, TenantStatus};
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Tenant registry
#[async_trait]
pub trait TenantManager: Send + Sync {
    /// All tenants that are not deactivated
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>>;

    /// Tenant by id
    async fn get_tenant_by_id(&self, id: &str) -> Result<Tenant>;

    /// Tenant by name
    async fn get_tenant_by_name(&self, name: &str) -> Result<Tenant>;

    /// The default tenant
    async fn get_default_tenant(&self) -> Result<Tenant>;

    /// Make `id` the default tenant, unsetting any previous default
    async fn set_default_tenant(&self, id: &str) -> Result<Tenant>;

    /// Connection string whose search path is the tenant schema
    async fn get_dsn_for_tenant(&self, name: &str) -> Result<String>;
}

/// Append the tenant search path to a base connection string
pub fn tenant_dsn(base_dsn: &str, tenant_name: &str) -> Result<String> {
    validate_tenant_name(tenant_name)?;

    let separator = if base_dsn.contains('?') { '&' } else { '?' };
    // options=-c search_path="sdp_<name>"
    Ok(format!(
        "{}{}options=-c%20search_path%3D%22{}%22",
        base_dsn,
        separator,
        schema_name(tenant_name)
    ))
}

const TENANT_COLUMNS: &str = "id, name, status, is_default, distribution_account_address, \
     distribution_account_type, distribution_account_status, circle_wallet_id, created_at, updated_at";

/// Tenant registry in the admin database
pub struct PgTenantManager {
    db_pool: Arc<PgPool>,
    base_dsn: String,
}

impl PgTenantManager {
    /// Create a new manager
    pub fn new(db_pool: Arc<PgPool>, base_dsn: impl Into<String>) -> Self {
        Self {
            db_pool,
            base_dsn: base_dsn.into(),
        }
    }

    async fn fetch_one(&self, filter: &str, value: &str) -> Result<Tenant> {
        let query = format!("SELECT {} FROM tenants WHERE {} = $1", TENANT_COLUMNS, filter);
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&*self.db_pool)
            .await?
            .ok_or_else(|| CoreError::TenantNotFound(value.to_string()))?;

        tenant_from_row(&row)
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    let account_type: Option<String> = row.try_get("distribution_account_type")?;
    let account_status: String = row.try_get("distribution_account_status")?;
    let status: String = row.try_get("status")?;

    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: TenantStatus::from_str(&status)?,
        is_default: row.try_get("is_default")?,
        distribution_account_address: row.try_get("distribution_account_address")?,
        distribution_account_type: account_type
            .as_deref()
            .map(AccountType::from_str)
            .transpose()?,
        distribution_account_status: AccountStatus::from_str(&account_status)?,
        circle_wallet_id: row.try_get("circle_wallet_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TenantManager for PgTenantManager {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>> {
        let query = format!(
            "SELECT {} FROM tenants WHERE status <> $1 ORDER BY name",
            TENANT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(TenantStatus::Deactivated.as_str())
            .fetch_all(&*self.db_pool)
            .await?;

        rows.iter().map(tenant_from_row).collect()
    }

    async fn get_tenant_by_id(&self, id: &str) -> Result<Tenant> {
        self.fetch_one("id", id).await
    }

    async fn get_tenant_by_name(&self, name: &str) -> Result<Tenant> {
        self.fetch_one("name", name).await
    }

    async fn get_default_tenant(&self) -> Result<Tenant> {
        let query = format!("SELECT {} FROM tenants WHERE is_default", TENANT_COLUMNS);
        let row = sqlx::query(&query)
            .fetch_optional(&*self.db_pool)
            .await?
            .ok_or_else(|| CoreError::TenantNotFound("default".to_string()))?;

        tenant_from_row(&row)
    }

    async fn set_default_tenant(&self, id: &str) -> Result<Tenant> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("UPDATE tenants SET is_default = false, updated_at = NOW() WHERE is_default AND id <> $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let query = format!(
            "UPDATE tenants SET is_default = true, updated_at = NOW() WHERE id = $1 RETURNING {}",
            TENANT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::TenantNotFound(id.to_string()))?;

        tx.commit().await?;

        info!(tenant_id = %id, "Default tenant updated");
        tenant_from_row(&row)
    }

    async fn get_dsn_for_tenant(&self, name: &str) -> Result<String> {
        tenant_dsn(&self.base_dsn, name)
    }
}

/// Tenant registry held in memory
pub struct InMemoryTenantManager {
    tenants: RwLock<HashMap<String, Tenant>>,
    base_dsn: String,
}

impl InMemoryTenantManager {
    /// Create an empty registry
    pub fn new(base_dsn: impl Into<String>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            base_dsn: base_dsn.into(),
        }
    }

    /// Add or replace a tenant
    pub fn upsert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl TenantManager for InMemoryTenantManager {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self
            .tenants
            .read()
            .values()
            .filter(|t| t.status != TenantStatus::Deactivated)
            .cloned()
            .collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn get_tenant_by_id(&self, id: &str) -> Result<Tenant> {
        self.tenants
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::TenantNotFound(id.to_string()))
    }

    async fn get_tenant_by_name(&self, name: &str) -> Result<Tenant> {
        self.tenants
            .read()
            .values()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| CoreError::TenantNotFound(name.to_string()))
    }

    async fn get_default_tenant(&self) -> Result<Tenant> {
        self.tenants
            .read()
            .values()
            .find(|t| t.is_default)
            .cloned()
            .ok_or_else(|| CoreError::TenantNotFound("default".to_string()))
    }

    async fn set_default_tenant(&self, id: &str) -> Result<Tenant> {
        let mut tenants = self.tenants.write();
        if !tenants.contains_key(id) {
            return Err(CoreError::TenantNotFound(id.to_string()));
        }

        let now = Utc::now();
        for tenant in tenants.values_mut() {
            let is_default = tenant.id == id;
            if tenant.is_default != is_default {
                tenant.is_default = is_default;
                tenant.updated_at = now;
            }
        }

        tenants
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::TenantNotFound(id.to_string()))
    }

    async fn get_dsn_for_tenant(&self, name: &str) -> Result<String> {
        tenant_dsn(&self.base_dsn, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_dsn() {
        let dsn = tenant_dsn("postgres://sdp@localhost:5432/sdp", "bluecorp").unwrap();
        assert_eq!(
            dsn,
            "postgres://sdp@localhost:5432/sdp?options=-c%20search_path%3D%22sdp_bluecorp%22"
        );

        let with_params = tenant_dsn("postgres://localhost/sdp?sslmode=disable", "redcorp").unwrap();
        assert!(with_params.starts_with("postgres://localhost/sdp?sslmode=disable&options="));

        assert!(tenant_dsn("postgres://localhost/sdp", "bad name").is_err());
    }

    #[tokio::test]
    async fn test_at_most_one_default_tenant() {
        let manager = InMemoryTenantManager::new("postgres://localhost/sdp");
        manager.upsert(Tenant::new("t1", "bluecorp"));
        manager.upsert(Tenant::new("t2", "redcorp"));

        manager.set_default_tenant("t1").await.unwrap();
        manager.set_default_tenant("t2").await.unwrap();

        let defaults: Vec<Tenant> = manager
            .get_all_tenants()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(manager.get_default_tenant().await.unwrap().id, "t2");
        assert!(manager.set_default_tenant("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_deactivated_tenants_are_hidden() {
        let manager = InMemoryTenantManager::new("postgres://localhost/sdp");
        let mut tenant = Tenant::new("t1", "bluecorp");
        tenant.status = TenantStatus::Deactivated;
        manager.upsert(tenant);

        assert!(manager.get_all_tenants().await.unwrap().is_empty());
        assert_eq!(manager.get_tenant_by_name("bluecorp").await.unwrap().id, "t1");
    }
}
