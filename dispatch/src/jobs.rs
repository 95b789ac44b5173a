//! Periodic jobs running across every tenant

use crate::metrics::JOB_RUNS;
use crate::reconciliation::CircleReconciliationService;
use crate::service::PaymentToSubmitterService;
use crate::store::PaymentModelsProvider;
use crate::{DispatchError, Result};
use async_trait::async_trait;
use disbursement_core::{RequestContext, Tenant, TenantManager, TenantStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Work repeated at a fixed interval
#[async_trait]
pub trait Job: Send + Sync {
    /// Job name, used in logs and metrics
    fn name(&self) -> &'static str;

    /// Time between runs
    fn interval(&self) -> Duration;

    /// One run
    async fn execute(&self) -> Result<()>;
}

/// Run `job` every interval until `shutdown` turns true. A failed run is logged and the
/// next one happens on schedule.
pub async fn run_job(job: Arc<dyn Job>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(job.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(job = job.name(), interval_ms = job.interval().as_millis() as u64, "Starting job");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match job.execute().await {
            Ok(()) => {
                JOB_RUNS.with_label_values(&[job.name(), "success"]).inc();
            }
            Err(e) => {
                JOB_RUNS.with_label_values(&[job.name(), "error"]).inc();
                error!(job = job.name(), error = %e, "Job run failed");
            }
        }
    }

    info!(job = job.name(), "Stopped job");
}

async fn active_tenants(tenants: &dyn TenantManager) -> Result<Vec<Tenant>> {
    Ok(tenants
        .get_all_tenants()
        .await?
        .into_iter()
        .filter(|t| t.status != TenantStatus::Deactivated)
        .collect())
}

fn collect_errors(job: &str, attempted: usize, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(DispatchError::InvalidRequest(format!(
        "{} failed for {} of {} tenants: {}",
        job,
        errors.len(),
        attempted,
        errors.join("; ")
    )))
}

/// Dispatches ready payments of every tenant in batches
pub struct ReadyPaymentsJob {
    tenants: Arc<dyn TenantManager>,
    service: Arc<PaymentToSubmitterService>,
    batch_size: usize,
    interval: Duration,
}

impl ReadyPaymentsJob {
    /// Create a job
    pub fn new(
        tenants: Arc<dyn TenantManager>,
        service: Arc<PaymentToSubmitterService>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            tenants,
            service,
            batch_size,
            interval,
        }
    }
}

#[async_trait]
impl Job for ReadyPaymentsJob {
    fn name(&self) -> &'static str {
        "ready_payments"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let tenants = active_tenants(self.tenants.as_ref()).await?;
        let mut errors = Vec::new();
        for tenant in &tenants {
            let ctx = RequestContext::for_tenant(Arc::new(tenant.clone()));
            match self.service.send_batch_payments(&ctx, self.batch_size).await {
                Ok(0) => {}
                Ok(dispatched) => {
                    debug!(tenant_id = %tenant.id, dispatched, "Dispatched ready payments")
                }
                Err(e) => errors.push(format!("{}: {}", tenant.id, e)),
            }
        }
        collect_errors(self.name(), tenants.len(), errors)
    }
}

/// Reconciles custodial transfers of every tenant
pub struct CircleReconciliationJob {
    tenants: Arc<dyn TenantManager>,
    models: Arc<dyn PaymentModelsProvider>,
    service: Arc<CircleReconciliationService>,
    interval: Duration,
}

impl CircleReconciliationJob {
    /// Create a job
    pub fn new(
        tenants: Arc<dyn TenantManager>,
        models: Arc<dyn PaymentModelsProvider>,
        service: Arc<CircleReconciliationService>,
        interval: Duration,
    ) -> Self {
        Self {
            tenants,
            models,
            service,
            interval,
        }
    }
}

#[async_trait]
impl Job for CircleReconciliationJob {
    fn name(&self) -> &'static str {
        "circle_reconciliation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let tenants = active_tenants(self.tenants.as_ref()).await?;
        let mut errors = Vec::new();
        for tenant in &tenants {
            let result = async {
                let models = self.models.models_for(tenant).await?;
                let ctx = RequestContext::for_tenant(Arc::new(tenant.clone()));
                self.service.reconcile(&ctx, &models).await
            }
            .await;
            if let Err(e) = result {
                errors.push(format!("{}: {}", tenant.id, e));
            }
        }
        collect_errors(self.name(), tenants.len(), errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DispatchError::InvalidRequest("boom".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_keeps_running_after_failures() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_job(job.clone(), rx));

        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(job.runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_job_stops_when_already_shut_down() {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let (_tx, rx) = watch::channel(true);
        run_job(job.clone(), rx).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
