//! Disbursement domain core
//!
//! Provides:
//! - Schema types shared by every crate (tenants, transaction accounts, payments)
//! - Request context and distribution account resolution
//! - Tenant lookup and the per-tenant database pool router
//! - Retry policies injected into network-bound operations

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

// Lets `string_enum!` name this crate the same way inside and outside of it.
extern crate self as disbursement_core;

#[macro_use]
mod macros;

pub mod account;
pub mod context;
pub mod data_source;
pub mod error;
pub mod metrics;
pub mod payment;
pub mod retry;
pub mod tenant;
pub mod tenant_manager;

pub use account::{AccountStatus, AccountType, Platform, TransactionAccount};
pub use context::{DistributionAccountResolver, RequestContext, TenantDistributionAccountResolver};
pub use data_source::{
    DataSourceOpener, MultiTenantDataSourceRouter, PgDataSourceRouter, PgPoolOpener, PoolConfig,
};
pub use error::{CoreError, Result};
pub use payment::{
    Asset, Disbursement, DisbursementStatus, Payment, PaymentBatch, PaymentStatus,
    ReceiverWallet, ReceiverWalletStatus,
};
pub use retry::RetryPolicy;
pub use tenant::{Tenant, TenantStatus};
pub use tenant_manager::{InMemoryTenantManager, PgTenantManager, TenantManager};

#[doc(hidden)]
pub use serde;
