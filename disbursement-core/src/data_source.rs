//! Per-tenant database pools
//!
//! One pool per tenant id, created on first use. Lookups are lock-free; creation takes
//! a single async lock and re-checks the cache so concurrent first requests for a new
//! tenant open exactly one pool.

use crate::context::RequestContext;
use crate::metrics::{DATA_SOURCE_POOLS_OPEN, DATA_SOURCE_POOLS_OPENED};
use crate::tenant::Tenant;
use crate::tenant_manager::TenantManager;
use crate::{CoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections per tenant
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
    /// Close connections idle for longer than this
    pub idle_timeout: Option<Duration>,
    /// Recycle connections older than this
    pub max_lifetime: Option<Duration>,
    /// Record pool metrics
    pub monitoring_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            monitoring_enabled: false,
        }
    }
}

/// Opens pools from connection strings
#[async_trait]
pub trait DataSourceOpener: Send + Sync {
    /// Pool type
    type Pool: Send + Sync + 'static;

    /// Open a pool
    async fn open(&self, dsn: &str, config: &PoolConfig) -> Result<Self::Pool>;

    /// Close a pool
    async fn close(&self, _pool: &Self::Pool) {}
}

/// Postgres pool opener
#[derive(Debug, Clone, Copy, Default)]
pub struct PgPoolOpener;

#[async_trait]
impl DataSourceOpener for PgPoolOpener {
    type Pool = PgPool;

    async fn open(&self, dsn: &str, config: &PoolConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(dsn)
            .await?;
        Ok(pool)
    }

    async fn close(&self, pool: &PgPool) {
        pool.close().await;
    }
}

/// Router over Postgres pools
pub type PgDataSourceRouter = MultiTenantDataSourceRouter<PgPoolOpener>;

/// Caches one pool per tenant
pub struct MultiTenantDataSourceRouter<O: DataSourceOpener> {
    tenant_manager: Arc<dyn TenantManager>,
    opener: O,
    config: PoolConfig,
    pools: DashMap<String, Arc<O::Pool>>,
    creation_lock: Mutex<()>,
}

impl<O: DataSourceOpener> MultiTenantDataSourceRouter<O> {
    /// Create a router
    pub fn new(tenant_manager: Arc<dyn TenantManager>, opener: O, config: PoolConfig) -> Self {
        Self {
            tenant_manager,
            opener,
            config,
            pools: DashMap::new(),
            creation_lock: Mutex::new(()),
        }
    }

    /// Pool for the tenant in `ctx`
    pub async fn get_data_source(&self, ctx: &RequestContext) -> Result<Arc<O::Pool>> {
        let tenant = ctx.require_tenant()?;
        self.get_data_source_for_tenant(tenant).await
    }

    /// Pool for `tenant`, opening it on first use
    pub async fn get_data_source_for_tenant(&self, tenant: &Tenant) -> Result<Arc<O::Pool>> {
        if let Some(pool) = self.pools.get(&tenant.id) {
            return Ok(pool.value().clone());
        }

        let _guard = self.creation_lock.lock().await;

        if let Some(pool) = self.pools.get(&tenant.id) {
            return Ok(pool.value().clone());
        }

        let dsn = self.tenant_manager.get_dsn_for_tenant(&tenant.name).await?;
        let pool = Arc::new(self.opener.open(&dsn, &self.config).await?);
        self.pools.insert(tenant.id.clone(), pool.clone());

        if self.config.monitoring_enabled {
            DATA_SOURCE_POOLS_OPENED
                .with_label_values(&[tenant.name.as_str()])
                .inc();
            DATA_SOURCE_POOLS_OPEN.set(self.pools.len() as i64);
        }

        info!(tenant_id = %tenant.id, tenant_name = %tenant.name, "Opened data source for tenant");
        Ok(pool)
    }

    /// Every cached pool
    pub fn get_all_data_sources(&self) -> Result<Vec<Arc<O::Pool>>> {
        let pools: Vec<Arc<O::Pool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        if pools.is_empty() {
            return Err(CoreError::NoDataSourcesAvailable);
        }
        Ok(pools)
    }

    /// Any cached pool
    pub fn any_data_source(&self) -> Result<Arc<O::Pool>> {
        self.pools
            .iter()
            .next()
            .map(|e| e.value().clone())
            .ok_or(CoreError::NoDataSourcesAvailable)
    }

    /// Number of cached pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool has been opened yet
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Close and forget every pool
    pub async fn close_all(&self) {
        let _guard = self.creation_lock.lock().await;

        let tenant_ids: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for tenant_id in tenant_ids {
            if let Some((_, pool)) = self.pools.remove(&tenant_id) {
                self.opener.close(&pool).await;
                info!(tenant_id = %tenant_id, "Closed data source for tenant");
            }
        }

        if self.config.monitoring_enabled {
            DATA_SOURCE_POOLS_OPEN.set(0);
        }
    }
}
