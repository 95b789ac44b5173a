//! Concurrency tests for the tenant data source router

use async_trait::async_trait;
use disbursement_core::{
    DataSourceOpener, InMemoryTenantManager, MultiTenantDataSourceRouter, PoolConfig, Result,
    Tenant,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opener that takes a while, so concurrent callers overlap
#[derive(Default)]
struct SlowOpener {
    opened: AtomicUsize,
}

struct FakePool {
    dsn: String,
}

#[async_trait]
impl DataSourceOpener for SlowOpener {
    type Pool = FakePool;

    async fn open(&self, dsn: &str, _config: &PoolConfig) -> Result<FakePool> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(FakePool {
            dsn: dsn.to_string(),
        })
    }
}

fn router() -> Arc<MultiTenantDataSourceRouter<SlowOpener>> {
    let manager = Arc::new(InMemoryTenantManager::new("postgres://localhost/sdp"));
    Arc::new(MultiTenantDataSourceRouter::new(
        manager,
        SlowOpener::default(),
        PoolConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_opens_one_pool() {
    let router = router();
    let tenant = Arc::new(Tenant::new("7c0d6ab4", "bluecorp"));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let router = router.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { router.get_data_source_for_tenant(&tenant).await })
        })
        .collect();

    let pools: Vec<Arc<FakePool>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first = &pools[0];
    assert!(pools.iter().all(|pool| Arc::ptr_eq(pool, first)));
    assert!(first.dsn.contains("sdp_bluecorp"));
    assert_eq!(router.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_access_for_distinct_tenants_opens_one_pool_each() {
    let router = router();
    let tenants: Vec<Arc<Tenant>> = (0..5)
        .map(|i| Arc::new(Tenant::new(format!("t{}", i), format!("tenant{}", i))))
        .collect();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let router = router.clone();
            let tenant = tenants[i % tenants.len()].clone();
            tokio::spawn(async move { router.get_data_source_for_tenant(&tenant).await })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(router.len(), 5);
    assert_eq!(router.get_all_data_sources().unwrap().len(), 5);
}
