//! Transaction submission
//!
//! Turns queued ledger payments into signed, submitted and tracked transactions:
//! - Submitter transaction store with a `Pending → Processing → {Success, Error}` lifecycle
//! - Channel accounts leased one submission at a time for independent sequence numbers
//! - Channel account provisioning and retirement on the ledger
//! - Funding of new accounts from the host account
//! - A worker that claims, signs, submits and classifies transactions

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod channel_account;
pub mod engine;
pub mod error;
pub mod funding;
pub mod limiter;
pub mod metrics;
pub mod store;

pub use channel_account::{
    ChannelAccountLease, ChannelAccountManager, ChannelAccountPool, ChannelAccountsReport,
    MAX_CHANNEL_ACCOUNTS, MAX_CHANNEL_ACCOUNTS_PER_TX,
};
pub use engine::{SubmitterConfig, TransactionWorker};
pub use error::{Result, SubmissionError};
pub use funding::AccountFunder;
pub use limiter::ProcessingLimiter;
pub use store::{
    InMemorySubmitterTransactionStore, NewSubmitterTransaction, PgSubmitterTransactionStore,
    SubmitterTransaction, SubmitterTransactionStore, TransactionStatus,
};
