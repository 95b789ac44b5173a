//! Payment dispatch
//!
//! Moves ready payments onto a settlement rail:
//! - Validation of each payment against its receiver wallet and disbursement
//! - Platform dispatchers for the ledger submitter and the custodial provider
//! - Custodial transfer requests and recipients with idempotent retries
//! - Event handlers for ready-to-pay and payment-completed events
//! - Periodic jobs for batch dispatch and custodial reconciliation

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod custodial;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod memo;
pub mod metrics;
pub mod reconciliation;
pub mod service;
pub mod store;
pub mod validation;

pub use custodial::{CustodialClient, CustodialHttpClient, CustodialHttpConfig, MockCustodialClient};
pub use dispatcher::{
    CircleApiType, CirclePaymentDispatcher, PaymentDispatcher, PlatformDispatcher,
    StellarPaymentDispatcher,
};
pub use error::{CustodialApiError, DispatchError, Result, ValidationError};
pub use handlers::{PaymentCompletedHandler, PaymentReadyToPayHandler};
pub use jobs::{run_job, CircleReconciliationJob, Job, ReadyPaymentsJob};
pub use memo::{MemoResolver, ResolvedMemo};
pub use reconciliation::CircleReconciliationService;
pub use service::PaymentToSubmitterService;
pub use store::{
    CircleRecipient, CircleRecipientStatus, CircleTransferRequest, CircleTransferStatus,
    InMemoryPaymentModelsProvider, InMemoryStores, ModelsTransaction, Organization, PaymentModels,
    PaymentModelsProvider, PgPaymentModelsProvider, TransactionalModels,
};
pub use validation::validate_payment_ready_for_sending;
