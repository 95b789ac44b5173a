//! Request context and distribution account resolution

use crate::account::TransactionAccount;
use crate::tenant::Tenant;
use crate::{CoreError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Who an operation runs on behalf of
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    tenant: Option<Arc<Tenant>>,
    instance_level: bool,
}

impl RequestContext {
    /// Operation scoped to one tenant
    pub fn for_tenant(tenant: Arc<Tenant>) -> Self {
        Self {
            tenant: Some(tenant),
            instance_level: false,
        }
    }

    /// Operation on behalf of the whole instance (host account, no tenant)
    pub fn instance() -> Self {
        Self {
            tenant: None,
            instance_level: true,
        }
    }

    /// Tenant, when present
    pub fn tenant(&self) -> Option<&Arc<Tenant>> {
        self.tenant.as_ref()
    }

    /// Tenant, or `TenantNotFoundInContext`
    pub fn require_tenant(&self) -> Result<&Arc<Tenant>> {
        self.tenant.as_ref().ok_or(CoreError::TenantNotFoundInContext)
    }

    /// Whether this is an instance-level operation
    pub fn is_instance_level(&self) -> bool {
        self.instance_level
    }
}

/// Resolves the account that disburses funds for the current context
#[async_trait]
pub trait DistributionAccountResolver: Send + Sync {
    /// Tenant distribution account, or the host account for instance-level contexts
    async fn distribution_account_from_context(
        &self,
        ctx: &RequestContext,
    ) -> Result<TransactionAccount>;

    /// Host account
    fn host_distribution_account(&self) -> TransactionAccount;
}

/// Resolver reading the distribution account from the tenant record
#[derive(Debug, Clone)]
pub struct TenantDistributionAccountResolver {
    host: TransactionAccount,
}

impl TenantDistributionAccountResolver {
    /// Create a resolver falling back to `host_address`
    pub fn new(host_address: impl Into<String>) -> Self {
        Self {
            host: TransactionAccount::host(host_address),
        }
    }
}

#[async_trait]
impl DistributionAccountResolver for TenantDistributionAccountResolver {
    async fn distribution_account_from_context(
        &self,
        ctx: &RequestContext,
    ) -> Result<TransactionAccount> {
        match ctx.tenant() {
            Some(tenant) => tenant.distribution_account(),
            None if ctx.is_instance_level() => Ok(self.host.clone()),
            None => Err(CoreError::TenantNotFoundInContext),
        }
    }

    fn host_distribution_account(&self) -> TransactionAccount {
        self.host.clone()
    }
}
