//! Disbursement Worker
//!
//! Dispatches ready payments to the ledger submitter or the custodial provider,
//! submits queued ledger transactions and reconciles custodial transfers.

mod config;

use anyhow::Context;
use config::Config;
use disbursement_core::{PgDataSourceRouter, PgPoolOpener, PgTenantManager, PoolConfig, TenantManager};
use dispatch::{
    run_job, CircleApiType, CirclePaymentDispatcher, CircleReconciliationJob,
    CircleReconciliationService, CustodialHttpClient, CustodialHttpConfig, PaymentCompletedHandler,
    PaymentModelsProvider, PaymentReadyToPayHandler, PaymentToSubmitterService,
    PgPaymentModelsProvider, PlatformDispatcher, ReadyPaymentsJob, StellarPaymentDispatcher,
};
use ledger_client::{HttpLedgerClient, HttpLedgerConfig, LedgerClient};
use message_bus::{
    EventConsumer, EventHandler, NatsClient, NatsConfig, NatsConsumer, NatsProducer, Producer,
    PublisherConfig, SubscriberConfig, CIRCLE_PAYMENT_READY_TO_PAY_TOPIC, PAYMENT_COMPLETED_TOPIC,
    PAYMENT_READY_TO_PAY_TOPIC,
};
use signing::{
    DistributionSignerType, PgSignerKeyStore, SignatureService, SignatureServiceOptions,
    SignerKeyStore, SignerTable,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use submission::{
    ChannelAccountManager, ChannelAccountPool, PgSubmitterTransactionStore, ProcessingLimiter,
    SubmitterConfig, SubmitterTransactionStore, TransactionWorker,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting Disbursement Worker");

    let config = Config::load()?;
    info!(
        ledger = %config.ledger.url,
        nats = %config.nats.url,
        custodial = config.custodial.enabled,
        "Configuration loaded"
    );

    let pool_config = PoolConfig {
        max_connections: config.database.max_connections,
        min_connections: config.database.min_connections,
        acquire_timeout: config.acquire_timeout(),
        ..Default::default()
    };
    let admin_pool = Arc::new(
        PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .acquire_timeout(pool_config.acquire_timeout)
            .connect(&config.database.url)
            .await
            .context("connecting to the admin database")?,
    );
    info!("Connected to admin database");

    let tenants: Arc<dyn TenantManager> = Arc::new(PgTenantManager::new(
        admin_pool.clone(),
        config.database.tenant_base_url.clone(),
    ));
    let router = Arc::new(PgDataSourceRouter::new(tenants.clone(), PgPoolOpener, pool_config));
    let models: Arc<dyn PaymentModelsProvider> = Arc::new(PgPaymentModelsProvider::new(router.clone()));

    // Signing
    let channel_keys: Arc<dyn SignerKeyStore> =
        Arc::new(PgSignerKeyStore::new(admin_pool.clone(), SignerTable::ChannelAccounts));
    let vault_keys: Arc<dyn SignerKeyStore> = Arc::new(PgSignerKeyStore::new(
        admin_pool.clone(),
        SignerTable::DistributionAccountVault,
    ));
    let distribution_signer_type = match config.signing.distribution_signer.as_str() {
        "env" => DistributionSignerType::Env,
        _ => DistributionSignerType::DbVault,
    };
    let signatures = Arc::new(SignatureService::new(SignatureServiceOptions {
        network_passphrase: config.ledger.network_passphrase.clone(),
        host_account_secret: config.signing.host_account_secret.clone(),
        distribution_account_secret: config.signing.distribution_account_secret.clone(),
        distribution_signer_type,
        encryption_passphrase: config.signing.encryption_passphrase.clone(),
        channel_account_store: channel_keys.clone(),
        distribution_vault_store: Some(vault_keys),
    })?);
    let resolver = signatures.distribution_resolver().clone();

    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(HttpLedgerConfig {
        base_url: config.ledger.url.clone(),
        network_passphrase: config.ledger.network_passphrase.clone(),
        request_timeout: Duration::from_secs(config.ledger.request_timeout_secs),
    })?);

    // Channel accounts
    let channel_pool = ChannelAccountPool::new();
    let channel_accounts = ChannelAccountManager::new(
        ledger.clone(),
        signatures.clone(),
        channel_keys,
        channel_pool.clone(),
    )
    .with_base_fee(config.submitter.base_fee);
    if config.submitter.channel_accounts > 0 {
        channel_accounts
            .ensure_channel_accounts_count(config.submitter.channel_accounts)
            .await
            .context("ensuring channel accounts")?;
    }
    let loaded = channel_accounts.load_pool().await?;
    if loaded == 0 {
        warn!("No channel accounts available; submitter workers will wait for one");
    }

    // Event bus
    let nats = Arc::new(NatsClient::new(NatsConfig {
        url: config.nats.url.clone(),
        stream_name: config.nats.stream_name.clone(),
        ..Default::default()
    }));
    nats.get_or_create_stream().await?;
    let producer: Arc<dyn Producer> =
        Arc::new(NatsProducer::new(nats.clone(), PublisherConfig::default()));

    // Dispatch
    let submitter_store: Arc<dyn SubmitterTransactionStore> =
        Arc::new(PgSubmitterTransactionStore::new(admin_pool.clone()));
    let mut dispatchers: Vec<PlatformDispatcher> =
        vec![StellarPaymentDispatcher::new(resolver.clone(), submitter_store.clone()).into()];

    let custodial = if config.custodial.enabled {
        let client = Arc::new(CustodialHttpClient::new(CustodialHttpConfig {
            base_url: config.custodial.url.clone(),
            api_key: config.custodial.api_key.clone(),
            request_timeout: Duration::from_secs(config.custodial.request_timeout_secs),
            ..Default::default()
        })?);
        let api_type = match config.custodial.api_type.as_str() {
            "payouts" => CircleApiType::Payouts,
            _ => CircleApiType::Transfers,
        };
        dispatchers.push(CirclePaymentDispatcher::new(resolver.clone(), client.clone(), api_type).into());
        Some(client)
    } else {
        None
    };

    let service = Arc::new(PaymentToSubmitterService::new(
        tenants.clone(),
        resolver.clone(),
        models.clone(),
        dispatchers,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Consumers
    let subscriber_config = SubscriberConfig {
        consumer_group: config.nats.consumer_group.clone(),
        ack_wait: Duration::from_secs(config.nats.ack_wait_secs),
        max_deliver: config.nats.max_deliver,
    };
    let ready_to_pay: Arc<dyn EventHandler> = Arc::new(PaymentReadyToPayHandler::stellar(service.clone()));
    let completed: Arc<dyn EventHandler> =
        Arc::new(PaymentCompletedHandler::new(tenants.clone(), models.clone()));
    let mut subscriptions = vec![
        (PAYMENT_READY_TO_PAY_TOPIC, vec![ready_to_pay]),
        (PAYMENT_COMPLETED_TOPIC, vec![completed]),
    ];
    if custodial.is_some() {
        let circle_ready_to_pay: Arc<dyn EventHandler> =
            Arc::new(PaymentReadyToPayHandler::circle(service.clone()));
        subscriptions.push((CIRCLE_PAYMENT_READY_TO_PAY_TOPIC, vec![circle_ready_to_pay]));
    }
    for (topic, handlers) in subscriptions {
        let consumer = NatsConsumer::connect(&nats, &subscriber_config, topic, handlers)
            .await
            .with_context(|| format!("subscribing to {}", topic))?;
        let consumer = EventConsumer::new(Arc::new(consumer));
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }

    // Submitter workers
    let limiter = Arc::new(ProcessingLimiter::new(config.submitter.processing_limit));
    let worker = Arc::new(
        TransactionWorker::new(
            submitter_store,
            ledger,
            signatures,
            channel_pool,
            tenants.clone(),
            SubmitterConfig {
                poll_interval: Duration::from_millis(config.submitter.poll_interval_ms),
                max_attempts: config.submitter.max_attempts,
                base_fee: config.submitter.base_fee,
                max_base_fee: config.submitter.max_base_fee,
                ..Default::default()
            },
        )
        .with_producer(producer)
        .with_limiter(limiter),
    );
    for _ in 0..config.submitter.workers {
        let worker = worker.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    // Jobs
    tasks.push(tokio::spawn(run_job(
        Arc::new(ReadyPaymentsJob::new(
            tenants.clone(),
            service,
            config.jobs.ready_payments_batch_size,
            Duration::from_secs(config.jobs.ready_payments_interval_secs),
        )),
        shutdown_rx.clone(),
    )));
    if let Some(client) = custodial {
        tasks.push(tokio::spawn(run_job(
            Arc::new(CircleReconciliationJob::new(
                tenants,
                models,
                Arc::new(CircleReconciliationService::new(resolver, client)),
                Duration::from_secs(config.jobs.reconciliation_interval_secs),
            )),
            shutdown_rx.clone(),
        )));
    }

    info!(
        tasks = tasks.len(),
        workers = config.submitter.workers,
        "Disbursement Worker running"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        warn!("No tasks left to notify");
    }

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task ended abnormally");
        }
    }
    router.close_all().await;
    admin_pool.close().await;

    info!("Disbursement Worker stopped");
    Ok(())
}
